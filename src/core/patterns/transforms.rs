// src/core/patterns/transforms.rs

//! The transform pipeline: a linear fold over an accumulator.
//!
//! Each step is `[name, ...args]`. The accumulator starts from the
//! extracted field value and is passed as the implicit first argument. A
//! `null` accumulator short-circuits every remaining step; a failing step
//! aborts the whole rule, so no message is produced. Transforms are pure:
//! no side effects, no user-controlled loops.

use crate::core::errors::PageVeilError;
use crate::core::sanitizer::{SanitizeOptions, sanitize_url};
use serde_json::Value;
use url::Url;

/// Path segments that would walk into prototype machinery in the source
/// data's original environment; always rejected.
const FORBIDDEN_SEGMENTS: [&str; 3] = ["__proto__", "constructor", "prototype"];

/// Runs `steps` over `initial`, returning the final accumulator.
pub fn run_pipeline(initial: Value, steps: &[Vec<Value>]) -> Result<Value, PageVeilError> {
    let mut acc = initial;
    for step in steps {
        if acc.is_null() {
            return Ok(Value::Null);
        }
        let name = step
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| {
                PageVeilError::TransformValidation("transform step without a name".to_string())
            })?;
        acc = apply(name, acc, &step[1..])?;
    }
    Ok(acc)
}

fn apply(name: &str, acc: Value, args: &[Value]) -> Result<Value, PageVeilError> {
    match name {
        "queryParam" => query_param(acc, arg_str(name, args, 0)?),
        "removeParams" => remove_params(acc, &arg_str_list(name, args, 0)?),
        "requireURL" => require_url(acc, arg_str(name, args, 0)?),
        "filterExact" => filter_exact(acc, &arg_str_list(name, args, 0)?),
        "maskU" => mask_url(acc, SanitizeOptions::default()),
        "strictMaskU" => mask_url(
            acc,
            SanitizeOptions {
                strict: true,
                ..SanitizeOptions::default()
            },
        ),
        "relaxedMaskU" => mask_url(
            acc,
            SanitizeOptions {
                try_preserve_path: true,
                ..SanitizeOptions::default()
            },
        ),
        "split" => split(acc, arg_str(name, args, 0)?, arg_index(name, args, 1)?, false),
        "trySplit" => split(acc, arg_str(name, args, 0)?, arg_index(name, args, 1)?, true),
        "decodeURIComponent" => decode_uri_component(acc, false),
        "tryDecodeURIComponent" => decode_uri_component(acc, true),
        "json" => extract_json(
            acc,
            arg_str(name, args, 0)?,
            args.get(1).and_then(Value::as_bool).unwrap_or(false),
        ),
        "trim" => Ok(as_str(&acc)
            .map(|s| Value::String(s.trim().to_string()))
            .unwrap_or(Value::Null)),
        other => Err(PageVeilError::UnsupportedTransformation(other.to_string())),
    }
}

// --- argument helpers ---

fn arg_str<'a>(name: &str, args: &'a [Value], index: usize) -> Result<&'a str, PageVeilError> {
    args.get(index).and_then(Value::as_str).ok_or_else(|| {
        PageVeilError::TransformValidation(format!(
            "transform '{name}' expects a string argument at position {index}"
        ))
    })
}

fn arg_str_list(name: &str, args: &[Value], index: usize) -> Result<Vec<String>, PageVeilError> {
    let list = args.get(index).and_then(Value::as_array).ok_or_else(|| {
        PageVeilError::TransformValidation(format!(
            "transform '{name}' expects a list argument at position {index}"
        ))
    })?;
    list.iter()
        .map(|v| {
            v.as_str().map(str::to_string).ok_or_else(|| {
                PageVeilError::TransformValidation(format!(
                    "transform '{name}' expects a list of strings"
                ))
            })
        })
        .collect()
}

fn arg_index(name: &str, args: &[Value], index: usize) -> Result<usize, PageVeilError> {
    args.get(index)
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .ok_or_else(|| {
            PageVeilError::TransformValidation(format!(
                "transform '{name}' expects a non-negative index at position {index}"
            ))
        })
}

fn as_str(value: &Value) -> Option<&str> {
    value.as_str()
}

// --- builtin transforms ---

fn query_param(acc: Value, param: &str) -> Result<Value, PageVeilError> {
    let Some(raw) = as_str(&acc) else {
        return Ok(Value::Null);
    };
    let Ok(url) = Url::parse(raw) else {
        return Ok(Value::Null);
    };
    Ok(url
        .query_pairs()
        .find(|(k, _)| k == param)
        .map(|(_, v)| Value::String(v.into_owned()))
        .unwrap_or(Value::Null))
}

fn remove_params(acc: Value, params: &[String]) -> Result<Value, PageVeilError> {
    let Some(raw) = as_str(&acc) else {
        return Ok(Value::Null);
    };
    let Ok(mut url) = Url::parse(raw) else {
        return Ok(Value::Null);
    };
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !params.iter().any(|p| p == k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept).finish();
    }
    Ok(Value::String(url.to_string()))
}

fn require_url(acc: Value, prefix: &str) -> Result<Value, PageVeilError> {
    Ok(match as_str(&acc) {
        Some(s) if s.starts_with(prefix) => acc,
        _ => Value::Null,
    })
}

fn filter_exact(acc: Value, allowed: &[String]) -> Result<Value, PageVeilError> {
    Ok(match as_str(&acc) {
        Some(s) if allowed.iter().any(|a| a == s) => acc,
        _ => Value::Null,
    })
}

fn mask_url(acc: Value, opts: SanitizeOptions) -> Result<Value, PageVeilError> {
    let Some(raw) = as_str(&acc) else {
        return Ok(Value::Null);
    };
    let sanitized = sanitize_url(raw, opts);
    Ok(sanitized
        .safe_url
        .map(Value::String)
        .unwrap_or(Value::Null))
}

fn split(acc: Value, separator: &str, index: usize, lenient: bool) -> Result<Value, PageVeilError> {
    let Some(raw) = as_str(&acc) else {
        return Ok(Value::Null);
    };
    match raw.split(separator).nth(index) {
        Some(part) => Ok(Value::String(part.to_string())),
        None if lenient => Ok(acc),
        None => Ok(Value::Null),
    }
}

fn decode_uri_component(acc: Value, lenient: bool) -> Result<Value, PageVeilError> {
    let decoded = match as_str(&acc) {
        Some(raw) => urlencoding::decode(raw).map(|d| d.into_owned()),
        None => return Ok(Value::Null),
    };
    match decoded {
        Ok(decoded) => Ok(Value::String(decoded)),
        Err(_) if lenient => Ok(acc),
        Err(e) => Err(PageVeilError::TransformValidation(format!(
            "decodeURIComponent failed: {e}"
        ))),
    }
}

fn extract_json(acc: Value, path: &str, extract_objects: bool) -> Result<Value, PageVeilError> {
    let Some(raw) = as_str(&acc) else {
        return Ok(Value::Null);
    };
    let Ok(parsed) = serde_json::from_str::<Value>(raw) else {
        return Ok(Value::Null);
    };
    let mut current = &parsed;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        if FORBIDDEN_SEGMENTS.contains(&segment) {
            return Ok(Value::Null);
        }
        match current.get(segment) {
            Some(next) => current = next,
            None => return Ok(Value::Null),
        }
    }
    Ok(match current {
        Value::String(_) | Value::Number(_) | Value::Bool(_) => current.clone(),
        Value::Object(_) | Value::Array(_) if extract_objects => current.clone(),
        _ => Value::Null,
    })
}
