//! Per-call fetch request: which attributes a caller wants, and the default
//! values to fall back on per key row.

use crate::column::{AttributeValue, Column};
use crate::error::CacheError;
use crate::schema::DictionarySchema;

/// Supplies the default value for a key row of one attribute.
///
/// When the caller passed a default column for the attribute, the value of
/// the key's row in that column is used; otherwise the attribute's
/// schema-level null value.
#[derive(Debug, Clone)]
pub struct DefaultValueProvider {
    null_value: AttributeValue,
    default_column: Option<Column>,
}

impl DefaultValueProvider {
    /// Create a provider with the schema null value as fallback.
    pub fn new(null_value: AttributeValue, default_column: Option<Column>) -> Self {
        Self {
            null_value,
            default_column,
        }
    }

    /// The default value for the given key row.
    pub fn value_at(&self, row: usize) -> AttributeValue {
        self.default_column
            .as_ref()
            .and_then(|column| column.get(row))
            .cloned()
            .unwrap_or_else(|| self.null_value.clone())
    }
}

/// Immutable description of what one dictionary call wants to fetch.
///
/// Holds the requested attribute indices in caller order, a fill bitmap over
/// all schema attributes, and one default value provider per schema
/// attribute. Storage may materialise more columns than requested when that
/// is cheaper; the bitmap tells aggregation which columns matter and
/// `filter_requested` drops the rest before returning to the caller.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    requested: Vec<usize>,
    fill: Vec<bool>,
    providers: Vec<DefaultValueProvider>,
}

impl FetchRequest {
    /// Build a request for the named attributes.
    ///
    /// `default_columns` is aligned with `attribute_names`; `None` entries
    /// fall back to the schema null value. Unknown attribute names fail with
    /// [`CacheError::Unsupported`].
    pub fn new(
        schema: &DictionarySchema,
        attribute_names: &[&str],
        default_columns: &[Option<Column>],
    ) -> Result<Self, CacheError> {
        if default_columns.len() != attribute_names.len() {
            return Err(CacheError::TypeMismatch(format!(
                "{} default columns supplied for {} requested attributes",
                default_columns.len(),
                attribute_names.len()
            )));
        }

        let mut requested = Vec::with_capacity(attribute_names.len());
        let mut fill = vec![false; schema.attributes().len()];
        let mut providers: Vec<Option<DefaultValueProvider>> =
            vec![None; schema.attributes().len()];

        for (name, default_column) in attribute_names.iter().zip(default_columns) {
            let index = schema.attribute_index(name).ok_or_else(|| {
                CacheError::Unsupported(format!("no attribute named '{name}' in dictionary"))
            })?;
            requested.push(index);
            fill[index] = true;
            providers[index] = Some(DefaultValueProvider::new(
                schema.attributes()[index].null_value.clone(),
                default_column.clone(),
            ));
        }

        let providers = providers
            .into_iter()
            .enumerate()
            .map(|(index, provider)| {
                provider.unwrap_or_else(|| {
                    DefaultValueProvider::new(schema.attributes()[index].null_value.clone(), None)
                })
            })
            .collect();

        Ok(Self {
            requested,
            fill,
            providers,
        })
    }

    /// Build an empty request: no attributes, used for existence checks.
    pub fn empty(schema: &DictionarySchema) -> Self {
        Self {
            requested: Vec::new(),
            fill: vec![false; schema.attributes().len()],
            providers: schema
                .attributes()
                .iter()
                .map(|attribute| DefaultValueProvider::new(attribute.null_value.clone(), None))
                .collect(),
        }
    }

    /// Total number of schema attributes the request spans.
    pub fn attributes_len(&self) -> usize {
        self.fill.len()
    }

    /// Number of attributes the caller asked for.
    pub fn requested_len(&self) -> usize {
        self.requested.len()
    }

    /// Whether the result column at the given schema index must be filled.
    pub fn should_fill(&self, attribute_index: usize) -> bool {
        self.fill.get(attribute_index).copied().unwrap_or(false)
    }

    /// Default value provider for the given schema attribute index.
    pub fn provider(&self, attribute_index: usize) -> &DefaultValueProvider {
        &self.providers[attribute_index]
    }

    /// Build empty result columns, one per schema attribute.
    pub fn make_result_columns(&self) -> Vec<Column> {
        vec![Vec::new(); self.fill.len()]
    }

    /// Keep only the columns the caller asked for, in caller order.
    pub fn filter_requested(&self, mut columns: Vec<Column>) -> Vec<Column> {
        self.requested
            .iter()
            .map(|index| std::mem::take(&mut columns[*index]))
            .collect()
    }
}
