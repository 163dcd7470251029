/// Application name
pub const APP_NAME: &str = "murmur";

/// Maximum message length in characters
pub const MAX_MESSAGE_LEN: usize = 5001;

/// Maximum emoji token length in characters (covers ZWJ sequences)
pub const MAX_EMOJI_LEN: usize = 32;

/// Maximum length of a client-chosen temporary message id
pub const MAX_CLIENT_TEMP_ID_LEN: usize = 64;

/// Typing signals expire after this long without a refresh
pub const TYPING_TIMEOUT_MS: u64 = 2_000;

/// Default per-connection outbound queue capacity
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Default and maximum history page sizes
pub const HISTORY_PAGE_DEFAULT: u32 = 50;
pub const HISTORY_PAGE_MAX: u32 = 200;

/// Default HTTP / WebSocket port
pub const DEFAULT_HTTP_PORT: u16 = 8080;
