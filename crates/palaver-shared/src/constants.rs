use std::time::Duration;

/// Throttle for "active" typing broadcasts while the user keeps typing.
pub const TYPING_BROADCAST_INTERVAL: Duration = Duration::from_secs(2);

/// Idle window after the last keystroke before the explicit stop broadcast.
pub const TYPING_IDLE_TIMEOUT: Duration = Duration::from_secs(3);

/// How long a received typing signal stays visible without a refresh.
pub const TYPING_SIGNAL_TTL: Duration = Duration::from_secs(4);

/// Heartbeat freshness window for the online/offline derivation, in minutes.
pub const ONLINE_WINDOW_MINUTES: i64 = 5;

/// How often an open conversation view refreshes its online list.
pub const PRESENCE_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// How often the local user's heartbeat timestamp is written.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Number of recent messages loaded for the community room.  Direct
/// conversations load their full history.
pub const ROOM_HISTORY_LIMIT: usize = 50;

/// Capacity of broadcast topics and command channels.
pub const CHANNEL_CAPACITY: usize = 256;
