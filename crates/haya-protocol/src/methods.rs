// Well-known WS method names. Dotted, lowercase.

// chat
pub const CHAT_SEND: &str = "chat.send";
pub const CHAT_STREAM: &str = "chat.stream";
pub const CHAT_ABORT: &str = "chat.abort";

// sessions
pub const SESSIONS_LIST: &str = "sessions.list";
pub const SESSIONS_CREATE: &str = "sessions.create";
pub const SESSIONS_DELETE: &str = "sessions.delete";
pub const SESSIONS_HISTORY: &str = "sessions.history";

// channels
pub const CHANNELS_LIST: &str = "channels.list";
pub const CHANNELS_START: &str = "channels.start";
pub const CHANNELS_STOP: &str = "channels.stop";

// cron / scheduler
pub const CRON_LIST: &str = "cron.list";
pub const CRON_STATUS: &str = "cron.status";
pub const CRON_ADD: &str = "cron.add";
pub const CRON_REMOVE: &str = "cron.remove";

// server → client events
pub const EVENT_CHAT_DELTA: &str = "chat.delta";
pub const EVENT_CHAT_TOOL_CALL: &str = "chat.tool_call";
pub const EVENT_CHAT_TOOL_RESULT: &str = "chat.tool_result";
pub const EVENT_CHAT_RESPONSE: &str = "chat.response";
pub const EVENT_TICK: &str = "tick";
