use thiserror::Error;

/// browser-kube error types
#[derive(Error, Debug)]
pub enum NodeError {
    /// Container client could not be constructed
    #[error("Container client initialization failed: {0}")]
    ClientInit(String),

    /// Pulling an image from its registry failed
    #[error("Image pull failed: {reference} - {message}")]
    ImagePull { reference: String, message: String },

    /// Requesting the save-archive of a pulled image failed
    #[error("Image save failed: {reference} - {message}")]
    ImageSave { reference: String, message: String },

    /// Tar archive could not be unpacked (I/O or malformed archive)
    #[error("Archive unpack failed: {0}")]
    Unpack(String),

    /// manifest.json missing from the save-archive
    #[error("Manifest read failed: {0}")]
    ManifestRead(String),

    /// manifest.json malformed or empty
    #[error("Manifest parse failed: {0}")]
    ManifestParse(String),

    /// A layer listed in the manifest is absent from the save-archive
    #[error("Layer read failed: {layer} - {message}")]
    LayerRead { layer: String, message: String },

    /// A requested file is not present in the merged image content
    #[error("Could not find requested file: {path:?}")]
    FileMissing { path: String },

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Image reference could not be parsed
    #[error("Invalid image reference: {0}")]
    InvalidReference(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP / WebSocket server error
    #[error("Server error: {0}")]
    Server(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for NodeError {
    fn from(err: serde_yaml::Error) -> Self {
        NodeError::Serialization(err.to_string())
    }
}

impl NodeError {
    /// Short, stable label for the failing stage. Used as a metrics label.
    pub fn stage(&self) -> &'static str {
        match self {
            NodeError::ClientInit(_) => "client_init",
            NodeError::ImagePull { .. } => "pull",
            NodeError::ImageSave { .. } => "save",
            NodeError::Unpack(_) => "unpack",
            NodeError::ManifestRead(_) => "manifest_read",
            NodeError::ManifestParse(_) => "manifest_parse",
            NodeError::LayerRead { .. } => "layer_read",
            NodeError::FileMissing { .. } => "file_missing",
            NodeError::Cancelled => "cancelled",
            NodeError::InvalidReference(_) => "reference",
            NodeError::Config(_) => "config",
            NodeError::Server(_) => "server",
            NodeError::Io(_) => "io",
            NodeError::Serialization(_) => "serialization",
        }
    }
}

/// Result type alias for browser-kube operations
pub type Result<T> = std::result::Result<T, NodeError>;
