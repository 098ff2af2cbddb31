//! Values crossing the boundary between the host and the Lua interpreter.
//!
//! Lua values are tied to the interpreter and cannot leave the dispatcher
//! thread. [`ScriptValue`] is the owned, thread-safe form used for event
//! payloads, the key-value store and JSON encoding.

use std::collections::BTreeMap;

use mlua::{IntoLua, Lua, Table, Value};

use crate::{BotError, Result};

/// Maximum table nesting accepted when converting from Lua.
///
/// Also guards against self-referencing tables.
pub const MAX_DEPTH: usize = 64;

/// An owned script value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ScriptValue {
    #[default]
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(String),
    /// A Lua sequence (keys exactly `1..n`).
    Array(Vec<ScriptValue>),
    /// Any other table, keyed by the string form of its keys.
    Table(BTreeMap<String, ScriptValue>),
}

impl ScriptValue {
    /// Build a table value from `(key, value)` pairs.
    pub fn table<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, ScriptValue)>,
    {
        ScriptValue::Table(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Look up a field of a table value.
    pub fn get(&self, key: &str) -> Option<&ScriptValue> {
        match self {
            ScriptValue::Table(map) => map.get(key),
            _ => None,
        }
    }

    /// Borrow the string contents, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, ScriptValue::Nil)
    }

    /// Convert a Lua value into an owned value.
    ///
    /// Functions, userdata, threads and tables nested deeper than
    /// [`MAX_DEPTH`] cannot be represented and produce an error.
    pub fn try_from_lua(value: &Value) -> Result<Self> {
        Self::from_lua_at_depth(value, 0)
    }

    fn from_lua_at_depth(value: &Value, depth: usize) -> Result<Self> {
        match value {
            Value::Nil => Ok(ScriptValue::Nil),
            Value::Boolean(b) => Ok(ScriptValue::Boolean(*b)),
            Value::Integer(i) => Ok(ScriptValue::Integer(*i)),
            Value::Number(n) => Ok(ScriptValue::Number(*n)),
            Value::String(s) => Ok(ScriptValue::String(s.to_string_lossy())),
            Value::Table(t) => {
                if depth >= MAX_DEPTH {
                    return Err(BotError::Json(format!(
                        "table nesting exceeds {} levels",
                        MAX_DEPTH
                    )));
                }
                Self::from_lua_table(t, depth + 1)
            }
            other => Err(BotError::Json(format!(
                "cannot convert Lua {} to a plain value",
                other.type_name()
            ))),
        }
    }

    fn from_lua_table(table: &Table, depth: usize) -> Result<Self> {
        let mut entries = Vec::new();
        for pair in table.pairs::<Value, Value>() {
            let (key, value) = pair?;
            entries.push((key, Self::from_lua_at_depth(&value, depth)?));
        }

        if is_sequence(&entries) {
            let mut items: Vec<(i64, ScriptValue)> = entries
                .into_iter()
                .filter_map(|(k, v)| match k {
                    Value::Integer(i) => Some((i, v)),
                    _ => None,
                })
                .collect();
            items.sort_by_key(|(i, _)| *i);
            return Ok(ScriptValue::Array(items.into_iter().map(|(_, v)| v).collect()));
        }

        let mut map = BTreeMap::new();
        for (key, value) in entries {
            map.insert(key_to_string(&key)?, value);
        }
        Ok(ScriptValue::Table(map))
    }

    /// Convert into a JSON value.
    ///
    /// Non-finite numbers have no JSON form and are rejected.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(match self {
            ScriptValue::Nil => serde_json::Value::Null,
            ScriptValue::Boolean(b) => serde_json::Value::Bool(*b),
            ScriptValue::Integer(i) => serde_json::Value::from(*i),
            ScriptValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .ok_or_else(|| BotError::Json(format!("cannot encode {} as JSON", n)))?,
            ScriptValue::String(s) => serde_json::Value::String(s.clone()),
            ScriptValue::Array(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(ScriptValue::to_json)
                    .collect::<Result<_>>()?,
            ),
            ScriptValue::Table(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.to_json()?)))
                    .collect::<Result<_>>()?,
            ),
        })
    }

    /// Convert from a JSON value. Integral numbers stay integers.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ScriptValue::Nil,
            serde_json::Value::Bool(b) => ScriptValue::Boolean(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => ScriptValue::Integer(i),
                None => ScriptValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => ScriptValue::String(s.clone()),
            serde_json::Value::Array(items) => {
                ScriptValue::Array(items.iter().map(ScriptValue::from_json).collect())
            }
            serde_json::Value::Object(map) => ScriptValue::Table(
                map.iter()
                    .map(|(k, v)| (k.clone(), ScriptValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Encode as a JSON string.
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string(&self.to_json()?).map_err(|e| BotError::Json(e.to_string()))
    }

    /// Decode a JSON string.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_str(s).map_err(|e| BotError::Json(e.to_string()))?;
        Ok(Self::from_json(&value))
    }
}

/// True when the keys are exactly the integers `1..=n` for some `n >= 1`.
fn is_sequence(entries: &[(Value, ScriptValue)]) -> bool {
    if entries.is_empty() {
        return false;
    }
    let n = entries.len() as i64;
    let mut seen = vec![false; entries.len()];
    for (key, _) in entries {
        match key {
            Value::Integer(i) if *i >= 1 && *i <= n => {
                seen[(*i - 1) as usize] = true;
            }
            _ => return false,
        }
    }
    seen.into_iter().all(|s| s)
}

fn key_to_string(key: &Value) -> Result<String> {
    match key {
        Value::String(s) => Ok(s.to_string_lossy()),
        Value::Integer(i) => Ok(i.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Boolean(b) => Ok(b.to_string()),
        other => Err(BotError::Json(format!(
            "unsupported table key of type {}",
            other.type_name()
        ))),
    }
}

impl IntoLua for ScriptValue {
    fn into_lua(self, lua: &Lua) -> mlua::Result<Value> {
        match self {
            ScriptValue::Nil => Ok(Value::Nil),
            ScriptValue::Boolean(b) => Ok(Value::Boolean(b)),
            ScriptValue::Integer(i) => Ok(Value::Integer(i)),
            ScriptValue::Number(n) => Ok(Value::Number(n)),
            ScriptValue::String(s) => s.into_lua(lua),
            ScriptValue::Array(items) => {
                let table = lua.create_table_with_capacity(items.len(), 0)?;
                for (i, item) in items.into_iter().enumerate() {
                    table.raw_set(i + 1, item)?;
                }
                Ok(Value::Table(table))
            }
            ScriptValue::Table(map) => {
                let table = lua.create_table_with_capacity(0, map.len())?;
                for (key, item) in map {
                    table.raw_set(key, item)?;
                }
                Ok(Value::Table(table))
            }
        }
    }
}

impl From<&str> for ScriptValue {
    fn from(s: &str) -> Self {
        ScriptValue::String(s.to_string())
    }
}

impl From<String> for ScriptValue {
    fn from(s: String) -> Self {
        ScriptValue::String(s)
    }
}

impl From<bool> for ScriptValue {
    fn from(b: bool) -> Self {
        ScriptValue::Boolean(b)
    }
}

impl From<i64> for ScriptValue {
    fn from(i: i64) -> Self {
        ScriptValue::Integer(i)
    }
}

impl From<f64> for ScriptValue {
    fn from(n: f64) -> Self {
        ScriptValue::Number(n)
    }
}
