use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{FieldKind, StrataError, StrataResult};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    OneToOne,
    ManyToOne,
    OneToMany,
    ManyToMany,
}

impl RelationKind {
    pub fn is_to_one(self) -> bool {
        matches!(self, RelationKind::OneToOne | RelationKind::ManyToOne)
    }

    pub fn is_to_many(self) -> bool {
        !self.is_to_one()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    #[default]
    Lazy,
    Eager,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDef {
    pub name: String,
    pub target: String,
    pub kind: RelationKind,
    /// Owning sides carry the foreign id (to-one) or the id snapshot (many-to-many).
    pub owning: bool,
    pub mapped_by: Option<String>,
    pub inversed_by: Option<String>,
    #[serde(default)]
    pub fetch: FetchMode,
}

impl RelationDef {
    fn new(name: &str, target: &str, kind: RelationKind, owning: bool) -> Self {
        Self {
            name: name.to_string(),
            target: target.to_string(),
            kind,
            owning,
            mapped_by: None,
            inversed_by: None,
            fetch: FetchMode::Lazy,
        }
    }

    pub fn many_to_one(name: &str, target: &str) -> Self {
        Self::new(name, target, RelationKind::ManyToOne, true)
    }

    pub fn one_to_one(name: &str, target: &str) -> Self {
        Self::new(name, target, RelationKind::OneToOne, true)
    }

    pub fn one_to_one_inverse(name: &str, target: &str, mapped_by: &str) -> Self {
        let mut relation = Self::new(name, target, RelationKind::OneToOne, false);
        relation.mapped_by = Some(mapped_by.to_string());
        relation
    }

    pub fn one_to_many(name: &str, target: &str, mapped_by: &str) -> Self {
        let mut relation = Self::new(name, target, RelationKind::OneToMany, false);
        relation.mapped_by = Some(mapped_by.to_string());
        relation
    }

    pub fn many_to_many(name: &str, target: &str) -> Self {
        Self::new(name, target, RelationKind::ManyToMany, true)
    }

    pub fn many_to_many_inverse(name: &str, target: &str, mapped_by: &str) -> Self {
        let mut relation = Self::new(name, target, RelationKind::ManyToMany, false);
        relation.mapped_by = Some(mapped_by.to_string());
        relation
    }

    pub fn inversed_by(mut self, field: &str) -> Self {
        self.inversed_by = Some(field.to_string());
        self
    }

    pub fn eager(mut self) -> Self {
        self.fetch = FetchMode::Eager;
        self
    }

    pub fn is_eager(&self) -> bool {
        self.fetch == FetchMode::Eager
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discriminator {
    pub field: String,
    pub value: String,
}

/// Declared shape of one host record type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub name: String,
    pub identifier: String,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub relations: Vec<RelationDef>,
    pub parent: Option<String>,
    pub discriminator: Option<Discriminator>,
}

impl EntitySchema {
    pub fn new(name: &str, identifier: &str) -> Self {
        Self {
            name: name.to_string(),
            identifier: identifier.to_string(),
            fields: Vec::new(),
            relations: Vec::new(),
            parent: None,
            discriminator: None,
        }
    }

    pub fn field(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.push(FieldDef {
            name: name.to_string(),
            kind,
        });
        self
    }

    pub fn relation(mut self, relation: RelationDef) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn extends(mut self, parent: &str) -> Self {
        self.parent = Some(parent.to_string());
        self
    }

    pub fn discriminated(mut self, field: &str, value: &str) -> Self {
        self.discriminator = Some(Discriminator {
            field: field.to_string(),
            value: value.to_string(),
        });
        self
    }
}

/// Validated set of record type descriptors, consulted by lookup only.
#[derive(Clone, Debug, Default)]
pub struct SchemaRegistry {
    types: BTreeMap<String, EntitySchema>,
    children: BTreeMap<String, Vec<String>>,
}

impl SchemaRegistry {
    pub fn new(schemas: impl IntoIterator<Item = EntitySchema>) -> StrataResult<Self> {
        let mut types = BTreeMap::new();
        for schema in schemas {
            if schema.identifier.trim().is_empty() {
                return Err(StrataError::validation(format!(
                    "type {} has no identifier field",
                    schema.name
                )));
            }
            let name = schema.name.clone();
            if types.insert(name.clone(), schema).is_some() {
                return Err(StrataError::validation(format!("duplicate type {name}")));
            }
        }

        let mut children: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for schema in types.values() {
            if let Some(parent) = &schema.parent {
                if !types.contains_key(parent) {
                    return Err(StrataError::validation(format!(
                        "type {} extends unknown type {parent}",
                        schema.name
                    )));
                }
                children
                    .entry(parent.clone())
                    .or_default()
                    .push(schema.name.clone());
            }
        }

        let registry = Self { types, children };
        registry.validate()?;
        Ok(registry)
    }

    fn validate(&self) -> StrataResult<()> {
        for schema in self.types.values() {
            let mut seen = BTreeSet::from([schema.name.as_str()]);
            let mut cursor = schema.parent.as_deref();
            while let Some(parent) = cursor {
                if !seen.insert(parent) {
                    return Err(StrataError::validation(format!(
                        "inheritance cycle through {}",
                        schema.name
                    )));
                }
                let parent_schema = &self.types[parent];
                if parent_schema.identifier != schema.identifier {
                    return Err(StrataError::validation(format!(
                        "type {} uses identifier {} but {parent} uses {}",
                        schema.name, schema.identifier, parent_schema.identifier
                    )));
                }
                cursor = parent_schema.parent.as_deref();
            }
        }

        for schema in self.types.values() {
            for relation in &schema.relations {
                if !self.types.contains_key(&relation.target) {
                    return Err(StrataError::validation(format!(
                        "relation {}.{} targets unknown type {}",
                        schema.name, relation.name, relation.target
                    )));
                }
                if let Some(mapped_by) = &relation.mapped_by
                    && self.relation(&relation.target, mapped_by).is_none()
                {
                    return Err(StrataError::validation(format!(
                        "relation {}.{} is mapped by unknown {}.{mapped_by}",
                        schema.name, relation.name, relation.target
                    )));
                }
            }
        }

        let mut discriminators: BTreeMap<(&str, &str), &str> = BTreeMap::new();
        for schema in self.types.values() {
            let Some(discriminator) = &schema.discriminator else {
                continue;
            };
            let root = self.root_of(&schema.name)?;
            if let Some(previous) =
                discriminators.insert((root, discriminator.value.as_str()), &schema.name)
            {
                return Err(StrataError::validation(format!(
                    "types {previous} and {} share discriminator value {}",
                    schema.name, discriminator.value
                )));
            }
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn get(&self, name: &str) -> StrataResult<&EntitySchema> {
        self.types
            .get(name)
            .ok_or_else(|| StrataError::validation(format!("unknown type {name}")))
    }

    pub fn types(&self) -> impl Iterator<Item = &EntitySchema> {
        self.types.values()
    }

    /// Ancestors of `name`, nearest first.
    pub fn ancestors(&self, name: &str) -> StrataResult<Vec<&str>> {
        let mut out = Vec::new();
        let mut cursor = self.get(name)?.parent.as_deref();
        while let Some(parent) = cursor {
            out.push(parent);
            cursor = self.get(parent)?.parent.as_deref();
        }
        Ok(out)
    }

    pub fn descendants(&self, name: &str) -> Vec<&str> {
        let mut out = Vec::new();
        let mut stack = vec![name];
        while let Some(current) = stack.pop() {
            if let Some(children) = self.children.get(current) {
                for child in children {
                    out.push(child.as_str());
                    stack.push(child.as_str());
                }
            }
        }
        out
    }

    pub fn root_of(&self, name: &str) -> StrataResult<&str> {
        let schema = self.get(name)?;
        Ok(self
            .ancestors(name)?
            .last()
            .copied()
            .unwrap_or(schema.name.as_str()))
    }

    /// Every type name a record of `name` may have been logged under.
    pub fn family(&self, name: &str) -> StrataResult<Vec<String>> {
        let mut out = vec![self.get(name)?.name.clone()];
        out.extend(self.ancestors(name)?.into_iter().map(str::to_string));
        out.extend(self.descendants(name).into_iter().map(str::to_string));
        Ok(out)
    }

    pub fn has_subtypes(&self, name: &str) -> bool {
        self.children.get(name).is_some_and(|children| !children.is_empty())
    }

    /// Own and inherited scalar fields, root type first.
    pub fn effective_fields(&self, name: &str) -> StrataResult<Vec<&FieldDef>> {
        let mut chain = self.ancestors(name)?;
        chain.reverse();
        chain.push(self.get(name)?.name.as_str());
        let mut out = Vec::new();
        for type_name in chain {
            out.extend(self.get(type_name)?.fields.iter());
        }
        Ok(out)
    }

    pub fn effective_relations(&self, name: &str) -> StrataResult<Vec<&RelationDef>> {
        let mut chain = self.ancestors(name)?;
        chain.reverse();
        chain.push(self.get(name)?.name.as_str());
        let mut out = Vec::new();
        for type_name in chain {
            out.extend(self.get(type_name)?.relations.iter());
        }
        Ok(out)
    }

    pub fn field(&self, name: &str, field: &str) -> Option<&FieldDef> {
        self.effective_fields(name)
            .ok()?
            .into_iter()
            .find(|def| def.name == field)
    }

    pub fn relation(&self, name: &str, field: &str) -> Option<&RelationDef> {
        self.effective_relations(name)
            .ok()?
            .into_iter()
            .find(|def| def.name == field)
    }

    /// Discriminator field shared by the family of `name`, if it is polymorphic.
    pub fn discriminator_field(&self, name: &str) -> Option<&str> {
        let root = self.root_of(name).ok()?;
        std::iter::once(root)
            .chain(self.descendants(root))
            .filter_map(|type_name| self.types.get(type_name))
            .find_map(|schema| schema.discriminator.as_ref())
            .map(|discriminator| discriminator.field.as_str())
    }

    /// Concrete type of the family of `name` declaring `value`.
    pub fn resolve_discriminator(&self, name: &str, value: &str) -> StrataResult<&str> {
        let root = self.root_of(name)?;
        std::iter::once(root)
            .chain(self.descendants(root))
            .filter_map(|type_name| self.types.get(type_name))
            .find(|schema| {
                schema
                    .discriminator
                    .as_ref()
                    .is_some_and(|discriminator| discriminator.value == value)
            })
            .map(|schema| schema.name.as_str())
            .ok_or_else(|| {
                StrataError::decode(format!("unknown discriminator value {value} for {root}"))
            })
    }
}
