use serde::{Deserialize, Serialize};

use crate::oid::Oid;

/// A single object mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectChange {
    Write { oid: Oid, data: Vec<u8> },
    Delete { oid: Oid },
}

impl ObjectChange {
    pub fn oid(&self) -> Oid {
        match self {
            Self::Write { oid, .. } | Self::Delete { oid } => *oid,
        }
    }
}

/// A single binding mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindingChange {
    Bind { name: String, oid: Oid },
    Unbind { name: String },
}

impl BindingChange {
    pub fn name(&self) -> &str {
        match self {
            Self::Bind { name, .. } | Self::Unbind { name } => name,
        }
    }
}

/// The ordered set of mutations produced by one committed node-local
/// transaction against one application's stores.
///
/// Mutations are applied in order, so a later change to the same key wins.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changeset {
    pub app: String,
    pub objects: Vec<ObjectChange>,
    pub bindings: Vec<BindingChange>,
}

impl Changeset {
    pub fn new(app: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            objects: Vec::new(),
            bindings: Vec::new(),
        }
    }

    pub fn write_object(&mut self, oid: Oid, data: Vec<u8>) -> &mut Self {
        self.objects.push(ObjectChange::Write { oid, data });
        self
    }

    pub fn delete_object(&mut self, oid: Oid) -> &mut Self {
        self.objects.push(ObjectChange::Delete { oid });
        self
    }

    pub fn bind(&mut self, name: impl Into<String>, oid: Oid) -> &mut Self {
        self.bindings.push(BindingChange::Bind { name: name.into(), oid });
        self
    }

    pub fn unbind(&mut self, name: impl Into<String>) -> &mut Self {
        self.bindings.push(BindingChange::Unbind { name: name.into() });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.bindings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.objects.len() + self.bindings.len()
    }

    /// Distinct oids touched, in ascending order.
    pub fn touched_oids(&self) -> Vec<Oid> {
        let mut oids: Vec<Oid> = self.objects.iter().map(ObjectChange::oid).collect();
        oids.sort();
        oids.dedup();
        oids
    }

    /// Distinct binding names touched, in ascending order.
    pub fn touched_bindings(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .bindings
            .iter()
            .map(|change| change.name().to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}
