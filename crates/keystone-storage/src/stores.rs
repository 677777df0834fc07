use crate::error::StoreResult;
use crate::traits::{StorageEngine, Store};

/// Key of the next-oid counter in the `meta` store.
pub const NEXT_OID_KEY: &[u8] = &[0x00];

/// The `names`/`oids`/`meta` store triple owned by one application.
#[derive(Clone, Debug)]
pub struct AppStores {
    pub app: String,
    /// Binding name -> encoded oid.
    pub names: Store,
    /// Encoded oid -> serialized payload.
    pub oids: Store,
    /// [`NEXT_OID_KEY`] -> next-oid counter.
    pub meta: Store,
}

impl AppStores {
    /// Open (creating if needed) the stores for `app` on the given engine.
    pub fn open(engine: &dyn StorageEngine, app: &str) -> StoreResult<Self> {
        Ok(Self {
            app: app.to_string(),
            names: engine.open_store(&format!("{app}.names"))?,
            oids: engine.open_store(&format!("{app}.oids"))?,
            meta: engine.open_store(&format!("{app}.meta"))?,
        })
    }
}
