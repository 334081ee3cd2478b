//! Dictionary schema: attribute declarations and key layout.

use crate::column::{AttributeType, AttributeValue, Column};
use crate::error::CacheError;

/// Declaration of a single dictionary attribute.
#[derive(Debug, Clone)]
pub struct AttributeDef {
    /// Attribute name, unique within the schema.
    pub name: String,
    /// Underlying value type.
    pub attribute_type: AttributeType,
    /// Schema-level null value, used as the default fallback.
    pub null_value: AttributeValue,
    /// Whether this attribute encodes the parent key of a hierarchy.
    pub hierarchical: bool,
}

impl AttributeDef {
    /// Create a non-hierarchical attribute.
    pub fn new(
        name: impl Into<String>,
        attribute_type: AttributeType,
        null_value: AttributeValue,
    ) -> Self {
        Self {
            name: name.into(),
            attribute_type,
            null_value,
            hierarchical: false,
        }
    }

    /// Mark the attribute as hierarchical.
    pub fn hierarchical(mut self) -> Self {
        self.hierarchical = true;
        self
    }
}

/// Key layout of the dictionary.
#[derive(Debug, Clone)]
pub enum KeyLayout {
    /// A single unsigned 64-bit key column.
    Simple {
        /// Name of the key column.
        name: String,
    },
    /// A tuple of typed key columns, compared as serialised bytes.
    Complex {
        /// Key columns: name and type, in key order.
        key_attributes: Vec<(String, AttributeType)>,
    },
}

impl KeyLayout {
    /// Number of key columns.
    pub fn arity(&self) -> usize {
        match self {
            KeyLayout::Simple { .. } => 1,
            KeyLayout::Complex { key_attributes } => key_attributes.len(),
        }
    }
}

/// Immutable description of a dictionary: key layout plus attributes.
#[derive(Debug, Clone)]
pub struct DictionarySchema {
    key_layout: KeyLayout,
    attributes: Vec<AttributeDef>,
}

impl DictionarySchema {
    /// Create a schema, validating attribute declarations.
    ///
    /// Fails with [`CacheError::TypeMismatch`] when a null value does not
    /// inhabit its attribute type, or when a hierarchical attribute is not
    /// `UInt64`. Fails with [`CacheError::InvalidConfig`] on an empty
    /// attribute list, an empty complex key, or a duplicate attribute name.
    pub fn new(key_layout: KeyLayout, attributes: Vec<AttributeDef>) -> Result<Self, CacheError> {
        if attributes.is_empty() {
            return Err(CacheError::InvalidConfig(
                "dictionary schema must declare at least one attribute".into(),
            ));
        }
        if let KeyLayout::Complex { key_attributes } = &key_layout {
            if key_attributes.is_empty() {
                return Err(CacheError::InvalidConfig(
                    "complex key layout must declare at least one key column".into(),
                ));
            }
        }

        for (index, attribute) in attributes.iter().enumerate() {
            if attributes[..index]
                .iter()
                .any(|other| other.name == attribute.name)
            {
                return Err(CacheError::InvalidConfig(format!(
                    "duplicate attribute name '{}'",
                    attribute.name
                )));
            }
            if !attribute.null_value.matches_type(&attribute.attribute_type) {
                return Err(CacheError::TypeMismatch(format!(
                    "null value of attribute '{}' does not match its declared type",
                    attribute.name
                )));
            }
            if attribute.hierarchical && attribute.attribute_type != AttributeType::UInt64 {
                return Err(CacheError::TypeMismatch(format!(
                    "hierarchical attribute '{}' must be UInt64",
                    attribute.name
                )));
            }
        }

        Ok(Self {
            key_layout,
            attributes,
        })
    }

    /// The key layout.
    pub fn key_layout(&self) -> &KeyLayout {
        &self.key_layout
    }

    /// Number of key columns expected ahead of the attribute columns.
    pub fn key_arity(&self) -> usize {
        self.key_layout.arity()
    }

    /// Declared attributes, in schema order.
    pub fn attributes(&self) -> &[AttributeDef] {
        &self.attributes
    }

    /// Index of the attribute with the given name.
    pub fn attribute_index(&self, name: &str) -> Option<usize> {
        self.attributes
            .iter()
            .position(|attribute| attribute.name == name)
    }

    /// Index of the hierarchical attribute, if one is declared.
    pub fn hierarchical_attribute_index(&self) -> Option<usize> {
        self.attributes
            .iter()
            .position(|attribute| attribute.hierarchical)
    }

    /// Build one column of schema null values per attribute, `rows` deep.
    pub fn null_columns(&self, rows: usize) -> Vec<Column> {
        self.attributes
            .iter()
            .map(|attribute| vec![attribute.null_value.clone(); rows])
            .collect()
    }
}
