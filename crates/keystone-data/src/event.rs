/// Observability events emitted by the data layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataEvent {
    /// A payload was loaded from the `oids` store.
    BytesRead { app: String, bytes: usize },
    /// A payload was flushed to the `oids` store.
    BytesWritten { app: String, bytes: usize },
}

impl DataEvent {
    pub fn bytes(&self) -> usize {
        match self {
            Self::BytesRead { bytes, .. } | Self::BytesWritten { bytes, .. } => *bytes,
        }
    }
}
