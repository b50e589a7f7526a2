use indexmap::IndexMap;
use serde::Serialize;

use crate::database_ops::PrimaryEntity;
use crate::normalization::Normalizer;

/// Entities sharing one canonical key, in fetch order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateGroup {
    pub key: String,
    pub members: Vec<PrimaryEntity>,
}

impl DuplicateGroup {
    pub fn ids(&self) -> Vec<String> {
        self.members.iter().map(|m| m.id.clone()).collect()
    }
}

/// Canonical key -> members. Key order is first-seen order.
///
/// Entities whose name normalizes to nothing (NULL, empty, whitespace) share
/// no display name with anything and are kept aside as unnamed.
#[derive(Debug, Default, Clone)]
pub struct Grouping {
    groups: IndexMap<String, Vec<PrimaryEntity>>,
    unnamed: Vec<PrimaryEntity>,
}

impl Grouping {
    pub fn build<I>(entities: I, normalizer: &Normalizer) -> Self
    where
        I: IntoIterator<Item = PrimaryEntity>,
    {
        let mut groups: IndexMap<String, Vec<PrimaryEntity>> = IndexMap::new();
        let mut unnamed = Vec::new();
        for entity in entities {
            let key = normalizer.key(&entity.name);
            if key.is_empty() {
                unnamed.push(entity);
            } else {
                groups.entry(key).or_default().push(entity);
            }
        }
        Self { groups, unnamed }
    }

    /// Groups of size > 1.
    pub fn candidates(&self) -> Vec<DuplicateGroup> {
        self.groups
            .iter()
            .filter(|(_, members)| members.len() > 1)
            .map(|(key, members)| DuplicateGroup {
                key: key.clone(),
                members: members.clone(),
            })
            .collect()
    }

    pub fn key_count(&self) -> usize {
        self.groups.len()
    }

    /// Entities placed under a non-empty key.
    pub fn entity_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn unnamed(&self) -> &[PrimaryEntity] {
        &self.unnamed
    }
}
