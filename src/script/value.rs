// src/script/value.rs
//! Conversion between rhai's `Dynamic` scripted values and our own
//! `OptionValue` union (§3), so options passed into a recipe script's
//! `DEPENDENCIES(options)` callable round-trip without leaking rhai types
//! past the adapter boundary.

use rhai::{Dynamic, Map as RhaiMap};

use crate::error::{Error, Result};
use crate::options::{OptionValue, Options};

pub fn options_to_dynamic(options: &Options) -> Dynamic {
    let mut map = RhaiMap::new();
    for (k, v) in &options.0 {
        map.insert(k.as_str().into(), option_value_to_dynamic(v));
    }
    Dynamic::from_map(map)
}

fn option_value_to_dynamic(value: &OptionValue) -> Dynamic {
    match value {
        OptionValue::Str(s) => Dynamic::from(s.clone()),
        OptionValue::Int(i) => Dynamic::from(*i),
        OptionValue::Bool(b) => Dynamic::from(*b),
        OptionValue::List(items) => {
            let arr: Vec<Dynamic> = items.iter().map(option_value_to_dynamic).collect();
            Dynamic::from(arr)
        }
        OptionValue::Map(opts) => options_to_dynamic(opts),
    }
}

pub fn dynamic_to_option_value(value: &Dynamic, path: &str) -> Result<OptionValue> {
    if let Some(s) = value.clone().try_cast::<String>() {
        return Ok(OptionValue::Str(s));
    }
    if let Some(i) = value.clone().try_cast::<i64>() {
        return Ok(OptionValue::Int(i));
    }
    if let Some(b) = value.clone().try_cast::<bool>() {
        return Ok(OptionValue::Bool(b));
    }
    if value.is_array() {
        let arr = value.clone().into_array().map_err(|_| parse_err(path, "expected array"))?;
        let items = arr
            .iter()
            .map(|v| dynamic_to_option_value(v, path))
            .collect::<Result<Vec<_>>>()?;
        return Ok(OptionValue::List(items));
    }
    if value.is_map() {
        let map = value
            .clone()
            .try_cast::<RhaiMap>()
            .ok_or_else(|| parse_err(path, "expected map"))?;
        let mut opts = Options::new();
        for (k, v) in map.iter() {
            opts.insert(k.to_string(), dynamic_to_option_value(v, path)?);
        }
        return Ok(OptionValue::Map(opts));
    }
    Err(parse_err(path, &format!("unsupported scripted value type: {}", value.type_name())))
}

fn parse_err(path: &str, message: &str) -> Error {
    Error::ParseError {
        path: path.into(),
        message: message.to_string(),
    }
}

pub fn map_get_str(map: &RhaiMap, key: &str) -> Option<String> {
    map.get(key).and_then(|v| v.clone().try_cast::<String>())
}

pub fn map_get_bool(map: &RhaiMap, key: &str) -> Option<bool> {
    map.get(key).and_then(|v| v.clone().try_cast::<bool>())
}

pub fn map_get_int(map: &RhaiMap, key: &str) -> Option<i64> {
    map.get(key).and_then(|v| v.clone().try_cast::<i64>())
}

pub fn map_get_map<'a>(map: &'a RhaiMap, key: &str) -> Option<RhaiMap> {
    map.get(key).and_then(|v| v.clone().try_cast::<RhaiMap>())
}
