use crate::layout::MirrorLayout;
use crate::StoreError;
use elmirror_schema::AllPackages;
use std::fs;

/// The full-index document (`all-packages`), kept as the serving layer
/// hands it to clients.
pub struct IndexStore {
    layout: MirrorLayout,
}

impl IndexStore {
    pub fn new(layout: MirrorLayout) -> Self {
        Self { layout }
    }

    pub fn save(&self, index: &AllPackages) -> Result<(), StoreError> {
        let content = serde_json::to_vec(index)?;
        crate::write_atomic(&self.layout.all_packages_file(), &content)
    }

    /// Raw bytes of the stored document, `None` before the first sync.
    pub fn load_raw(&self) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.layout.all_packages_file();
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read(path)?))
    }

    pub fn load(&self) -> Result<Option<AllPackages>, StoreError> {
        match self.load_raw()? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }
}
