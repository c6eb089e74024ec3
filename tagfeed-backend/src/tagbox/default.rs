//! The stock tagbox: default filter and process stages, no `run`.

use std::sync::Arc;

use crate::error::Result;
use crate::models::TagboxSpec;

use super::Tagbox;

pub struct DefaultTagbox {
    spec: TagboxSpec,
}

impl DefaultTagbox {
    pub fn new(spec: TagboxSpec) -> Self {
        Self { spec }
    }

    /// Factory entry for kind `default`.
    pub fn construct(spec: TagboxSpec) -> Result<Arc<dyn Tagbox>> {
        Ok(Arc::new(Self::new(spec)))
    }
}

impl Tagbox for DefaultTagbox {
    fn spec(&self) -> &TagboxSpec {
        &self.spec
    }
}
