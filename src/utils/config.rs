use crate::algorithms::SolverMethod;
use crate::core::{
    AnchorPosition, RangeLink, DEFAULT_CLIENT_BUFFER, DEFAULT_HTTP_PORT, DEFAULT_MAX_LINE_BYTES, DEFAULT_TCP_PORT,
    MIN_ANCHORS,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// File name of the anchor layout inside `CONFIG_PATH`
pub const ANCHOR_FILE_NAME: &str = "anchorPositions.json";

/// Runtime settings for the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port anchors connect to (`TCP_PORT`)
    pub tcp_port: u16,
    /// Port of the fan-out HTTP/WebSocket server (`PORT`)
    pub http_port: u16,
    /// Interface both listeners bind to (`HOST`)
    pub host: String,
    /// Anchor layout file (`ANCHORS_FILE`, or `CONFIG_PATH`/anchorPositions.json)
    pub anchors_path: PathBuf,
    /// Run the solver on every frame (`POSITIONING`)
    pub positioning: bool,
    /// Solver linearization (`SOLVER`)
    pub solver: SolverMethod,
    /// Per-client event queue depth (`CLIENT_BUFFER`)
    pub client_buffer: usize,
    /// Longest accepted record in bytes (`MAX_LINE_BYTES`)
    pub max_line_bytes: usize,
    /// Allowed browser origin for the fan-out server, `*` for any (`CORS_ORIGIN`)
    pub cors_origin: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_port: DEFAULT_TCP_PORT,
            http_port: DEFAULT_HTTP_PORT,
            host: "0.0.0.0".to_string(),
            anchors_path: Path::new("config").join(ANCHOR_FILE_NAME),
            positioning: true,
            solver: SolverMethod::default(),
            client_buffer: DEFAULT_CLIENT_BUFFER,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            cors_origin: "*".to_string(),
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Invalid parameter value
    InvalidParameter { parameter: String, value: String, reason: String },
    /// Configuration file I/O error
    IoError { message: String },
    /// JSON deserialization error
    SerializationError { message: String },
    /// Anchor layout rejected
    AnchorConflict { anchor_id: String, reason: String },
    /// Not enough anchors for a 2-D fix
    InsufficientAnchors { available: usize, required: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidParameter { parameter, value, reason } => {
                write!(f, "Invalid {} = '{}': {}", parameter, value, reason)
            }
            ConfigError::IoError { message } => write!(f, "I/O error: {}", message),
            ConfigError::SerializationError { message } => write!(f, "Parse error: {}", message),
            ConfigError::AnchorConflict { anchor_id, reason } => {
                write!(f, "Anchor '{}' rejected: {}", anchor_id, reason)
            }
            ConfigError::InsufficientAnchors { available, required } => {
                write!(f, "{} anchors configured, at least {} required", available, required)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl ServerConfig {
    /// Build the configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("TCP_PORT") {
            config.tcp_port = parse_param("TCP_PORT", &value)?;
        }
        if let Some(value) = lookup("PORT") {
            config.http_port = parse_param("PORT", &value)?;
        }
        if let Some(value) = lookup("HOST") {
            config.host = value.trim().to_string();
        }
        if let Some(path) = lookup("ANCHORS_FILE") {
            config.anchors_path = PathBuf::from(path);
        } else if let Some(dir) = lookup("CONFIG_PATH") {
            config.anchors_path = Path::new(&dir).join(ANCHOR_FILE_NAME);
        }
        if let Some(value) = lookup("POSITIONING") {
            config.positioning = parse_bool("POSITIONING", &value)?;
        }
        if let Some(value) = lookup("SOLVER") {
            config.solver = value.parse().map_err(|reason| ConfigError::InvalidParameter {
                parameter: "SOLVER".to_string(),
                value: value.clone(),
                reason,
            })?;
        }
        if let Some(value) = lookup("CLIENT_BUFFER") {
            config.client_buffer = parse_param("CLIENT_BUFFER", &value)?;
        }
        if let Some(value) = lookup("MAX_LINE_BYTES") {
            config.max_line_bytes = parse_param("MAX_LINE_BYTES", &value)?;
        }
        if let Some(value) = lookup("CORS_ORIGIN") {
            config.cors_origin = value.trim().to_string();
        }

        config.validate()?;
        Ok(config)
    }

    /// Check values that would only fail later at bind or run time
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(invalid("HOST", &self.host, "must not be empty"));
        }
        if self.tcp_port != 0 && self.tcp_port == self.http_port {
            return Err(invalid(
                "PORT",
                &self.http_port.to_string(),
                "must differ from TCP_PORT",
            ));
        }
        if self.client_buffer == 0 {
            return Err(invalid("CLIENT_BUFFER", "0", "must be at least 1"));
        }
        if self.max_line_bytes == 0 {
            return Err(invalid("MAX_LINE_BYTES", "0", "must be at least 1"));
        }
        if self.cors_origin.is_empty() {
            return Err(invalid("CORS_ORIGIN", "", "use '*' to allow any origin"));
        }
        Ok(())
    }

    /// `host:port` of the ingestion listener
    pub fn ingest_address(&self) -> String {
        join_host_port(&self.host, self.tcp_port)
    }

    /// `host:port` of the fan-out server
    pub fn http_address(&self) -> String {
        join_host_port(&self.host, self.http_port)
    }
}

/// Fixed set of anchor positions for one deployment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnchorSet {
    anchors: Vec<AnchorPosition>,
    #[serde(skip)]
    index: HashMap<String, usize>,
    /// Layout document as loaded, when it came from JSON
    #[serde(skip)]
    source: Option<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AnchorFile {
    List(Vec<AnchorPosition>),
    Wrapped { anchors: Vec<AnchorPosition> },
}

impl AnchorSet {
    /// Validate and index a list of anchors
    pub fn new(anchors: Vec<AnchorPosition>) -> Result<Self, ConfigError> {
        if anchors.len() < MIN_ANCHORS {
            return Err(ConfigError::InsufficientAnchors {
                available: anchors.len(),
                required: MIN_ANCHORS,
            });
        }

        let mut index = HashMap::with_capacity(anchors.len());
        for (i, anchor) in anchors.iter().enumerate() {
            if anchor.id.trim().is_empty() {
                return Err(ConfigError::AnchorConflict {
                    anchor_id: anchor.id.clone(),
                    reason: format!("anchor {} has an empty ID", i),
                });
            }
            if !(anchor.x.is_finite() && anchor.y.is_finite()) {
                return Err(ConfigError::AnchorConflict {
                    anchor_id: anchor.id.clone(),
                    reason: "coordinates must be finite".to_string(),
                });
            }
            if index.insert(anchor.id.clone(), i).is_some() {
                return Err(ConfigError::AnchorConflict {
                    anchor_id: anchor.id.clone(),
                    reason: "duplicate anchor ID".to_string(),
                });
            }
        }

        Ok(Self {
            anchors,
            index,
            source: None,
        })
    }

    /// Parse a JSON list of anchors, bare or under an `anchors` key
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let parse_error = |e: serde_json::Error| ConfigError::SerializationError {
            message: format!("Failed to parse anchor layout: {}", e),
        };
        let source: serde_json::Value = serde_json::from_str(content).map_err(parse_error)?;
        let file = AnchorFile::deserialize(&source).map_err(parse_error)?;

        let mut set = match file {
            AnchorFile::List(anchors) | AnchorFile::Wrapped { anchors } => Self::new(anchors)?,
        };
        set.source = Some(source);
        Ok(set)
    }

    /// The layout as served to clients: the loaded document unchanged, or
    /// `{"anchors": [...]}` for a set built in code
    pub fn layout_json(&self) -> serde_json::Result<serde_json::Value> {
        match &self.source {
            Some(source) => Ok(source.clone()),
            None => serde_json::to_value(self),
        }
    }

    /// Load the anchor layout from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let content = fs::read_to_string(&path).map_err(|e| ConfigError::IoError {
            message: format!("Failed to read anchor file '{}': {}", path_str, e),
        })?;

        Self::from_json(&content).map_err(|e| match e {
            ConfigError::SerializationError { message } => ConfigError::SerializationError {
                message: format!("{} ('{}')", message, path_str),
            },
            other => other,
        })
    }

    pub fn get(&self, anchor_id: &str) -> Option<&AnchorPosition> {
        self.index.get(anchor_id).map(|&i| &self.anchors[i])
    }

    pub fn anchors(&self) -> &[AnchorPosition] {
        &self.anchors
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Match a frame's links to known anchors, in link order.
    ///
    /// Links from unknown anchors are skipped, as are repeated links from an
    /// anchor already matched in the same frame.
    pub fn pair_links(&self, links: &[RangeLink]) -> (Vec<AnchorPosition>, Vec<f64>) {
        let mut anchors = Vec::with_capacity(links.len());
        let mut distances = Vec::with_capacity(links.len());

        for link in links {
            let Some(anchor) = self.get(&link.anchor_id) else {
                tracing::trace!(anchor_id = %link.anchor_id, "link from unknown anchor skipped");
                continue;
            };
            if anchors.iter().any(|a: &AnchorPosition| a.id == anchor.id) {
                continue;
            }
            anchors.push(anchor.clone());
            distances.push(link.distance);
        }

        (anchors, distances)
    }

    /// True when every anchor lies on one line, which leaves every frame unsolvable
    pub fn is_collinear(&self) -> bool {
        let first = &self.anchors[0];
        // Farthest anchor from the first gives the most stable direction
        let Some(far) = self
            .anchors
            .iter()
            .max_by(|a, b| {
                a.distance_to(first.x, first.y)
                    .total_cmp(&b.distance_to(first.x, first.y))
            })
        else {
            return true;
        };

        let (dx, dy) = (far.x - first.x, far.y - first.y);
        let length = dx.hypot(dy);
        if length == 0.0 {
            return true;
        }

        self.anchors.iter().all(|a| {
            let cross = dx * (a.y - first.y) - dy * (a.x - first.x);
            (cross / length).abs() < 1e-6 * length.max(1.0)
        })
    }
}

fn parse_param<T: std::str::FromStr>(parameter: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| invalid(parameter, value, &e.to_string()))
}

fn parse_bool(parameter: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(parameter, value, "expected true or false")),
    }
}

fn invalid(parameter: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidParameter {
        parameter: parameter.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn three_anchors() -> Vec<AnchorPosition> {
        vec![
            AnchorPosition::new("A1", 0.0, 0.0),
            AnchorPosition::new("A2", 4.0, 0.0),
            AnchorPosition::new("A3", 0.0, 4.0),
        ]
    }

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.tcp_port, 8080);
        assert_eq!(config.http_port, 5000);
        assert_eq!(config.solver, SolverMethod::Trilateration);
        assert!(config.positioning);
        assert_eq!(config.cors_origin, "*");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_lookup() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("TCP_PORT", "9000"),
            ("PORT", "9001"),
            ("HOST", "127.0.0.1"),
            ("CONFIG_PATH", "/etc/uwb"),
            ("POSITIONING", "off"),
            ("SOLVER", "least_squares"),
            ("CLIENT_BUFFER", "8"),
        ]))
        .unwrap();

        assert_eq!(config.ingest_address(), "127.0.0.1:9000");
        assert_eq!(config.http_address(), "127.0.0.1:9001");
        assert_eq!(config.anchors_path, Path::new("/etc/uwb").join(ANCHOR_FILE_NAME));
        assert!(!config.positioning);
        assert_eq!(config.solver, SolverMethod::LeastSquares);
        assert_eq!(config.client_buffer, 8);
    }

    #[test]
    fn test_anchors_file_overrides_config_path() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("CONFIG_PATH", "/etc/uwb"),
            ("ANCHORS_FILE", "/tmp/site.json"),
        ]))
        .unwrap();
        assert_eq!(config.anchors_path, PathBuf::from("/tmp/site.json"));
    }

    #[test]
    fn test_invalid_port_rejected() {
        let result = ServerConfig::from_lookup(lookup_from(&[("TCP_PORT", "eighty")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidParameter { ref parameter, .. }) if parameter == "TCP_PORT"
        ));
    }

    #[test]
    fn test_port_clash_rejected() {
        let result = ServerConfig::from_lookup(lookup_from(&[("TCP_PORT", "7000"), ("PORT", "7000")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_client_buffer_rejected() {
        let result = ServerConfig::from_lookup(lookup_from(&[("CLIENT_BUFFER", "0")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_ipv6_host_is_bracketed() {
        let config = ServerConfig {
            host: "::1".to_string(),
            ..Default::default()
        };
        assert_eq!(config.ingest_address(), "[::1]:8080");
    }

    #[test]
    fn test_anchor_set_from_json_forms() {
        let bare = AnchorSet::from_json(r#"[{"id":"A1","x":0,"y":0},{"id":"A2","x":4,"y":0},{"id":"A3","x":0,"y":4}]"#)
            .unwrap();
        let wrapped = AnchorSet::from_json(
            r#"{"anchors":[{"id":"A1","x":0,"y":0},{"id":"A2","x":4,"y":0},{"id":"A3","x":0,"y":4}]}"#,
        )
        .unwrap();

        assert_eq!(bare.anchors(), wrapped.anchors());
        assert_eq!(bare.len(), 3);
        assert_eq!(bare.get("A2"), Some(&AnchorPosition::new("A2", 4.0, 0.0)));
        assert!(bare.get("A9").is_none());
    }

    #[test]
    fn test_layout_json_keeps_file_shape() {
        let text = r#"[{"id":"A1","x":0,"y":0,"label":"door"},{"id":"A2","x":4,"y":0},{"id":"A3","x":0,"y":4}]"#;
        let set = AnchorSet::from_json(text).unwrap();
        assert_eq!(set.layout_json().unwrap(), serde_json::from_str::<serde_json::Value>(text).unwrap());

        let built = AnchorSet::new(three_anchors()).unwrap();
        let layout = built.layout_json().unwrap();
        assert_eq!(layout["anchors"].as_array().map(Vec::len), Some(3));
    }

    #[test]
    fn test_anchor_set_requires_three() {
        let result = AnchorSet::new(three_anchors()[..2].to_vec());
        assert_eq!(
            result,
            Err(ConfigError::InsufficientAnchors { available: 2, required: 3 })
        );
    }

    #[test]
    fn test_duplicate_anchor_rejected() {
        let mut anchors = three_anchors();
        anchors.push(AnchorPosition::new("A2", 9.0, 9.0));
        assert!(matches!(
            AnchorSet::new(anchors),
            Err(ConfigError::AnchorConflict { ref anchor_id, .. }) if anchor_id == "A2"
        ));
    }

    #[test]
    fn test_collinear_detection() {
        assert!(!AnchorSet::new(three_anchors()).unwrap().is_collinear());

        let line = AnchorSet::new(vec![
            AnchorPosition::new("A1", 0.0, 0.0),
            AnchorPosition::new("A2", 5.0, 5.0),
            AnchorPosition::new("A3", 10.0, 10.0),
        ])
        .unwrap();
        assert!(line.is_collinear());
    }

    #[test]
    fn test_pair_links_skips_unknown_and_repeats() {
        let set = AnchorSet::new(three_anchors()).unwrap();
        let links = vec![
            RangeLink::new("A3", 3.0),
            RangeLink::new("X9", 7.0),
            RangeLink::new("A1", 1.0),
            RangeLink::new("A3", 99.0),
        ];

        let (anchors, distances) = set.pair_links(&links);
        let ids: Vec<&str> = anchors.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["A3", "A1"]);
        assert_eq!(distances, vec![3.0, 1.0]);
    }

    #[test]
    fn test_anchor_file_roundtrip_through_disk() {
        let path = std::env::temp_dir().join(format!("uwb_anchors_{}.json", std::process::id()));
        fs::write(&path, serde_json::to_string(&AnchorSet::new(three_anchors()).unwrap()).unwrap()).unwrap();

        let loaded = AnchorSet::from_file(&path).unwrap();
        assert_eq!(loaded.anchors(), three_anchors().as_slice());

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_missing_anchor_file() {
        let result = AnchorSet::from_file("/nonexistent/anchorPositions.json");
        assert!(matches!(result, Err(ConfigError::IoError { .. })));
    }
}
