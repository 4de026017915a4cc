use crate::vault::restore::TableScope;
use crate::vault::result_error::error::Error;
use crate::vault::result_error::result::Result;
use derive_more::{Display, From};
use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt::Formatter;
use std::result;

/// Table-name pattern. Matching ignores case, engines disagree on it.
#[derive(Clone, Debug, From, Display, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct TableGlob {
    glob: Glob,
}

impl TableGlob {
    pub fn new(pattern: &str) -> Result<Self> {
        Ok(GlobBuilder::new(pattern)
            .case_insensitive(true)
            .build()?
            .into())
    }
}

struct TableGlobVisitor;

impl Visitor<'_> for TableGlobVisitor {
    type Value = TableGlob;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a table name glob pattern")
    }

    fn visit_str<E>(self, v: &str) -> result::Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        TableGlob::new(v).map_err(serde::de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for TableGlob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> result::Result<Self, D::Error> {
        deserializer.deserialize_str(TableGlobVisitor)
    }
}

/// Logical groups of tables selectable in a selective import, by name.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct TableGroups {
    groups: BTreeMap<String, Vec<TableGlob>>,
}

static DEFAULT_GROUPS: &[(&str, &[&str])] = &[
    ("settings", &["settings", "settings_*", "*_settings", "site_config*"]),
    ("users", &["users", "user_*", "users_*", "auth_*", "*_users"]),
    ("customers", &["customers", "customer_*", "customers_*"]),
    (
        "catalog",
        &["catalog_*", "items", "item_*", "products", "product_*", "categories"],
    ),
    ("orders", &["orders", "order_*", "orders_*", "invoices*", "payments*"]),
    ("inspections", &["inspections", "inspection_*", "inspections_*"]),
];

impl Default for TableGroups {
    fn default() -> Self {
        let groups = DEFAULT_GROUPS
            .iter()
            .map(|(name, patterns)| {
                let globs = patterns
                    .iter()
                    .filter_map(|p| TableGlob::new(p).ok())
                    .collect();
                (name.to_string(), globs)
            })
            .collect();
        Self { groups }
    }
}

impl TableGroups {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// First group (by name) whose patterns match `table`.
    pub fn group_of(&self, table: &str) -> Option<&str> {
        self.groups
            .iter()
            .find(|(_, globs)| globs.iter().any(|g| g.glob.compile_matcher().is_match(table)))
            .map(|(name, _)| name.as_str())
    }

    /// Scope covering the tables of `selected`. Unknown group names are rejected.
    pub fn scope<S: AsRef<str>>(&self, selected: &[S]) -> Result<TableScope> {
        if selected.is_empty() {
            return Err(Error::invalid_state(
                "selective import needs at least one table group",
            ));
        }
        let mut builder = GlobSetBuilder::new();
        for name in selected {
            let globs = self.groups.get(name.as_ref()).ok_or_else(|| {
                Error::not_found("table group", name.as_ref())
            })?;
            globs.iter().for_each(|g| {
                builder.add(g.glob.clone());
            });
        }
        let set: GlobSet = builder.build()?;
        tracing::debug!(
            "Selective scope over {} glob(s) from groups {:?}",
            set.len(),
            selected.iter().map(AsRef::as_ref).collect::<Vec<_>>()
        );
        Ok(TableScope::only(move |table| set.is_match(table)))
    }
}
