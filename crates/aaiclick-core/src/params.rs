//! Parameter and result serialization.
//!
//! All data flow across task boundaries is by reference: kwargs values and
//! task results are JSON blobs naming a ClickHouse table, never native
//! scalars. This keeps task payloads small and data residency in ClickHouse.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ParameterError;

/// A serialized reference to an Object or a View.
///
/// Wire forms:
/// - `{"object_type": "object", "table_id": "t…"}`
/// - `{"object_type": "view", "table_id": "t…", "offset"?: n, "limit"?: n, "where"?: s}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "object_type", rename_all = "lowercase")]
pub enum ParamRef {
    Object {
        table_id: String,
    },
    View {
        table_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offset: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "where")]
        where_clause: Option<String>,
    },
}

impl ParamRef {
    /// The referenced table name.
    pub fn table_id(&self) -> &str {
        match self {
            Self::Object { table_id } => table_id,
            Self::View { table_id, .. } => table_id,
        }
    }

    /// Validate the reference beyond what serde enforces structurally.
    pub fn validate(&self) -> Result<(), ParameterError> {
        let table_id = self.table_id();
        if table_id.is_empty() {
            return Err(ParameterError("empty table_id".to_owned()));
        }
        if !is_artifact_table_name(table_id) {
            return Err(ParameterError(format!(
                "table_id {table_id:?} does not match t<digits>"
            )));
        }
        if let Self::View { limit: Some(0), .. } = self {
            return Err(ParameterError("view limit must be positive".to_owned()));
        }
        Ok(())
    }
}

/// Whether a name is a well-formed data-artifact table name (`t<digits>`).
///
/// Everything the core drops or reads on the data plane must pass this;
/// it doubles as the injection guard for identifiers spliced into SQL.
pub fn is_artifact_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next() == Some('t') && {
        let rest = chars.as_str();
        !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit())
    }
}

/// Build the stored result blob for a completed task that produced a table.
pub fn object_result(table_id: &str) -> serde_json::Value {
    serde_json::json!({ "object_type": "object", "table_id": table_id })
}

/// Parse a task's kwargs blob into named parameter references.
///
/// The blob must be a JSON object; every value must be a well-formed
/// Object/View reference. Anything else is a [`ParameterError`].
pub fn parse_kwargs(
    kwargs: &serde_json::Value,
) -> Result<BTreeMap<String, ParamRef>, ParameterError> {
    let map = kwargs
        .as_object()
        .ok_or_else(|| ParameterError(format!("kwargs must be a JSON object, got {kwargs}")))?;

    let mut out = BTreeMap::new();
    for (name, value) in map {
        let param: ParamRef = serde_json::from_value(value.clone())
            .map_err(|e| ParameterError(format!("kwarg {name:?}: {e}")))?;
        param
            .validate()
            .map_err(|e| ParameterError(format!("kwarg {name:?}: {e}")))?;
        out.insert(name.clone(), param);
    }
    Ok(out)
}

/// Serialize named parameter references into a kwargs blob.
pub fn to_kwargs(params: &BTreeMap<String, ParamRef>) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = params
        .iter()
        .map(|(name, param)| {
            (
                name.clone(),
                serde_json::to_value(param).expect("ParamRef serialization is infallible"),
            )
        })
        .collect();
    serde_json::Value::Object(map)
}
