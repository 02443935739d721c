//! Protocol constants and system defaults

/// Minimum number of anchors for a 2-D fix
pub const MIN_ANCHORS: usize = 3;

/// Default TCP port anchors stream ranging data to
pub const DEFAULT_TCP_PORT: u16 = 8080;

/// Default HTTP port of the fan-out server
pub const DEFAULT_HTTP_PORT: u16 = 5000;

/// Default per-client event queue depth in the broadcast hub
pub const DEFAULT_CLIENT_BUFFER: usize = 256;

/// Longest record the frame parser buffers before giving up on the line (bytes)
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

/// Event carrying the raw `links` array of each frame
pub const UWB_DATA_EVENT: &str = "uwb_data";

/// Event carrying each solved tag position
pub const TAG_POSITION_EVENT: &str = "tag_position";
