use serde::{Deserialize, Serialize};

use crate::model::ParentRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    ManyToMany,
    OneToMany,
}

/// How the related table is linked to the parent table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelationLink {
    ManyToMany {
        pivot_table: String,
        /// Pivot column holding the parent id
        foreign_pivot_key: String,
        /// Pivot column holding the related id
        related_pivot_key: String,
    },
    OneToMany {
        /// Column on the related table holding the parent id
        foreign_key: String,
    },
    /// Any relation the reconciler cannot synchronize (e.g. belongs-to).
    /// Resolving it yields no relationship.
    Other,
}

/// A named relation declared on a parent table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipDef {
    pub parent_table: String,
    pub name: String,
    pub related_table: String,
    pub link: RelationLink,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManyToMany {
    pub parent: ParentRecord,
    pub related_table: String,
    pub pivot_table: String,
    pub foreign_pivot_key: String,
    pub related_pivot_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OneToMany {
    pub parent: ParentRecord,
    pub related_table: String,
    pub foreign_key: String,
}

/// A relation bound to one parent record. The variant is fixed at resolution time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Relationship {
    ManyToMany(ManyToMany),
    OneToMany(OneToMany),
}

impl Relationship {
    pub fn kind(&self) -> RelationKind {
        match self {
            Relationship::ManyToMany(_) => RelationKind::ManyToMany,
            Relationship::OneToMany(_) => RelationKind::OneToMany,
        }
    }

    pub fn parent(&self) -> &ParentRecord {
        match self {
            Relationship::ManyToMany(rel) => &rel.parent,
            Relationship::OneToMany(rel) => &rel.parent,
        }
    }

    pub fn related_table(&self) -> &str {
        match self {
            Relationship::ManyToMany(rel) => &rel.related_table,
            Relationship::OneToMany(rel) => &rel.related_table,
        }
    }
}

/// Relation declarations, looked up by parent table and relation name.
#[derive(Debug, Clone, Default)]
pub struct RelationRegistry {
    defs: Vec<RelationshipDef>,
}

impl RelationRegistry {
    pub fn new(defs: Vec<RelationshipDef>) -> Self {
        Self { defs }
    }

    pub fn find(&self, parent_table: &str, name: &str) -> Option<&RelationshipDef> {
        self.defs
            .iter()
            .find(|def| def.parent_table == parent_table && def.name == name)
    }

    /// Binds `name` to `parent`. Returns `None` when there is no parent, no relation
    /// name, no such relation, or a relation that is neither many-to-many nor
    /// one-to-many. Callers treat `None` as "nothing to synchronize".
    pub fn resolve(&self, parent: Option<&ParentRecord>, name: Option<&str>) -> Option<Relationship> {
        let parent = parent?;
        let name = name.filter(|name| !name.is_empty())?;

        let Some(def) = self.find(&parent.table, name) else {
            log::debug!("No relation '{}' declared on '{}'", name, parent.table);
            return None;
        };

        match &def.link {
            RelationLink::ManyToMany {
                pivot_table,
                foreign_pivot_key,
                related_pivot_key,
            } => Some(Relationship::ManyToMany(ManyToMany {
                parent: parent.clone(),
                related_table: def.related_table.clone(),
                pivot_table: pivot_table.clone(),
                foreign_pivot_key: foreign_pivot_key.clone(),
                related_pivot_key: related_pivot_key.clone(),
            })),
            RelationLink::OneToMany { foreign_key } => Some(Relationship::OneToMany(OneToMany {
                parent: parent.clone(),
                related_table: def.related_table.clone(),
                foreign_key: foreign_key.clone(),
            })),
            RelationLink::Other => {
                log::debug!(
                    "Relation '{}' on '{}' is not synchronizable, keeping rows transient",
                    name,
                    parent.table
                );
                None
            }
        }
    }
}
