//! The closed set of atom kinds
//!
//! Kinds arrive on the wire as strings. They are parsed once at the edge
//! into [`AtomKind`]; every branch on a kind inside the engine is an
//! exhaustive `match`, so adding a kind is a compile-checked change.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Every kind of atom the cache knows how to store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AtomKind {
    ActionDiffList,
    ActionPrototypeViewList,
    ActionViewList,
    AttributeTree,
    AuditLogsForComponent,
    Component,
    ComponentDiff,
    ComponentInList,
    ComponentList,
    DependentValueComponentList,
    DependentValues,
    ErasedComponents,
    IncomingConnections,
    IncomingConnectionsList,
    IncomingManagementConnections,
    ManagementConnections,
    SchemaMembers,
    SchemaVariant,
    SecretDefinition,
    View,
    ViewComponentList,
    ViewList,
    /// Descriptor of a change-set index (the index stored as an atom).
    MvIndex,
    // Deployment-scoped
    CachedSchema,
    CachedSchemaVariant,
    CachedDefaultVariant,
    /// Descriptor of the deployment index.
    DeploymentMvIndex,
}

impl AtomKind {
    /// All kinds, in declaration order
    pub const ALL: [Self; 27] = [
        Self::ActionDiffList,
        Self::ActionPrototypeViewList,
        Self::ActionViewList,
        Self::AttributeTree,
        Self::AuditLogsForComponent,
        Self::Component,
        Self::ComponentDiff,
        Self::ComponentInList,
        Self::ComponentList,
        Self::DependentValueComponentList,
        Self::DependentValues,
        Self::ErasedComponents,
        Self::IncomingConnections,
        Self::IncomingConnectionsList,
        Self::IncomingManagementConnections,
        Self::ManagementConnections,
        Self::SchemaMembers,
        Self::SchemaVariant,
        Self::SecretDefinition,
        Self::View,
        Self::ViewComponentList,
        Self::ViewList,
        Self::MvIndex,
        Self::CachedSchema,
        Self::CachedSchemaVariant,
        Self::CachedDefaultVariant,
        Self::DeploymentMvIndex,
    ];

    /// Wire name of the kind
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ActionDiffList => "ActionDiffList",
            Self::ActionPrototypeViewList => "ActionPrototypeViewList",
            Self::ActionViewList => "ActionViewList",
            Self::AttributeTree => "AttributeTree",
            Self::AuditLogsForComponent => "AuditLogsForComponent",
            Self::Component => "Component",
            Self::ComponentDiff => "ComponentDiff",
            Self::ComponentInList => "ComponentInList",
            Self::ComponentList => "ComponentList",
            Self::DependentValueComponentList => "DependentValueComponentList",
            Self::DependentValues => "DependentValues",
            Self::ErasedComponents => "ErasedComponents",
            Self::IncomingConnections => "IncomingConnections",
            Self::IncomingConnectionsList => "IncomingConnectionsList",
            Self::IncomingManagementConnections => "IncomingManagementConnections",
            Self::ManagementConnections => "ManagementConnections",
            Self::SchemaMembers => "SchemaMembers",
            Self::SchemaVariant => "SchemaVariant",
            Self::SecretDefinition => "SecretDefinition",
            Self::View => "View",
            Self::ViewComponentList => "ViewComponentList",
            Self::ViewList => "ViewList",
            Self::MvIndex => "ChangeSetMvIndex",
            Self::CachedSchema => "CachedSchema",
            Self::CachedSchemaVariant => "CachedSchemaVariant",
            Self::CachedDefaultVariant => "CachedDefaultVariant",
            Self::DeploymentMvIndex => "DeploymentMvIndex",
        }
    }

    /// Deployment-scoped kinds live in the global atom table.
    #[must_use]
    pub const fn is_global(self) -> bool {
        match self {
            Self::CachedSchema
            | Self::CachedSchemaVariant
            | Self::CachedDefaultVariant
            | Self::DeploymentMvIndex => true,
            Self::ActionDiffList
            | Self::ActionPrototypeViewList
            | Self::ActionViewList
            | Self::AttributeTree
            | Self::AuditLogsForComponent
            | Self::Component
            | Self::ComponentDiff
            | Self::ComponentInList
            | Self::ComponentList
            | Self::DependentValueComponentList
            | Self::DependentValues
            | Self::ErasedComponents
            | Self::IncomingConnections
            | Self::IncomingConnectionsList
            | Self::IncomingManagementConnections
            | Self::ManagementConnections
            | Self::SchemaMembers
            | Self::SchemaVariant
            | Self::SecretDefinition
            | Self::View
            | Self::ViewComponentList
            | Self::ViewList
            | Self::MvIndex => false,
        }
    }

    /// "X List" kinds: collections of references to other atoms.
    ///
    /// Lists are patched incrementally by the message stream and are not
    /// invalidated on every member change.
    #[must_use]
    pub const fn is_list(self) -> bool {
        match self {
            Self::ActionDiffList
            | Self::ActionPrototypeViewList
            | Self::ActionViewList
            | Self::ComponentList
            | Self::DependentValueComponentList
            | Self::IncomingConnectionsList
            | Self::ViewComponentList
            | Self::ViewList => true,
            Self::AttributeTree
            | Self::AuditLogsForComponent
            | Self::Component
            | Self::ComponentDiff
            | Self::ComponentInList
            | Self::DependentValues
            | Self::ErasedComponents
            | Self::IncomingConnections
            | Self::IncomingManagementConnections
            | Self::ManagementConnections
            | Self::SchemaMembers
            | Self::SchemaVariant
            | Self::SecretDefinition
            | Self::View
            | Self::MvIndex
            | Self::CachedSchema
            | Self::CachedSchemaVariant
            | Self::CachedDefaultVariant
            | Self::DeploymentMvIndex => false,
        }
    }

    /// Kinds that feed a derived in-memory projection.
    #[must_use]
    pub const fn is_computed(self) -> bool {
        match self {
            Self::IncomingConnections | Self::ManagementConnections | Self::AttributeTree => true,
            Self::ActionDiffList
            | Self::ActionPrototypeViewList
            | Self::ActionViewList
            | Self::AuditLogsForComponent
            | Self::Component
            | Self::ComponentDiff
            | Self::ComponentInList
            | Self::ComponentList
            | Self::DependentValueComponentList
            | Self::DependentValues
            | Self::ErasedComponents
            | Self::IncomingConnectionsList
            | Self::IncomingManagementConnections
            | Self::SchemaMembers
            | Self::SchemaVariant
            | Self::SecretDefinition
            | Self::View
            | Self::ViewComponentList
            | Self::ViewList
            | Self::MvIndex
            | Self::CachedSchema
            | Self::CachedSchemaVariant
            | Self::CachedDefaultVariant
            | Self::DeploymentMvIndex => false,
        }
    }

    /// Index descriptors are bookkeeping atoms, never index members.
    #[must_use]
    pub const fn is_index_descriptor(self) -> bool {
        matches!(self, Self::MvIndex | Self::DeploymentMvIndex)
    }
}

impl fmt::Display for AtomKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A kind string that is not part of [`AtomKind`]
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown atom kind: {0}")]
pub struct UnknownKind(pub String);

impl FromStr for AtomKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

impl TryFrom<String> for AtomKind {
    type Error = UnknownKind;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AtomKind> for String {
    fn from(kind: AtomKind) -> Self {
        kind.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_through_wire_name() {
        for kind in AtomKind::ALL {
            assert_eq!(kind.as_str().parse::<AtomKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_index_descriptor_wire_name() {
        assert_eq!(AtomKind::MvIndex.as_str(), "ChangeSetMvIndex");
        assert_eq!(
            "ChangeSetMvIndex".parse::<AtomKind>().unwrap(),
            AtomKind::MvIndex
        );
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let err = "LuminorkDefaultVariant".parse::<AtomKind>().unwrap_err();
        assert_eq!(err, UnknownKind("LuminorkDefaultVariant".into()));
    }

    #[test]
    fn test_kind_classification() {
        assert!(AtomKind::ComponentList.is_list());
        assert!(!AtomKind::Component.is_list());
        assert!(AtomKind::CachedSchema.is_global());
        assert!(!AtomKind::ComponentInList.is_global());
        assert!(AtomKind::IncomingConnections.is_computed());
        assert!(AtomKind::MvIndex.is_index_descriptor());
    }

    #[test]
    fn test_kind_serde() {
        let json = serde_json::to_string(&AtomKind::MvIndex).unwrap();
        assert_eq!(json, "\"ChangeSetMvIndex\"");
        let kind: AtomKind = serde_json::from_str("\"ViewList\"").unwrap();
        assert_eq!(kind, AtomKind::ViewList);
        assert!(serde_json::from_str::<AtomKind>("\"Nope\"").is_err());
    }
}
