pub mod backtest;
pub mod batch;
pub mod scan;

use crate::data::{load_bars, load_directory, select_index};
use crate::models::Bar;
use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Strategy parameters from inline JSON (`{"channel_period": 30}`) or a JSON
/// file. Booleans become 0/1.
pub fn parse_parameters(raw: Option<&str>) -> Result<HashMap<String, f64>> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(HashMap::new());
    };
    let text = if raw.starts_with('{') {
        raw.to_string()
    } else {
        fs::read_to_string(raw).with_context(|| format!("Failed to read parameter file {}", raw))?
    };
    let value: Value = serde_json::from_str(&text).context("Parameters must be a JSON object")?;
    let Value::Object(entries) = value else {
        return Err(anyhow!("Parameters must be a JSON object"));
    };
    entries
        .into_iter()
        .map(|(key, value)| -> Result<(String, f64)> {
            let number = match &value {
                Value::Number(n) => n.as_f64(),
                Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
                _ => None,
            }
            .ok_or_else(|| anyhow!("Parameter {} must be a number or boolean (value: {})", key, value))?;
            Ok((key, number))
        })
        .collect()
}

/// Index bars for `index_symbol`: the matching series of the index file, or,
/// without a file, that symbol taken out of the universe so it is not traded.
pub fn load_index(
    path: Option<&Path>,
    index_symbol: &str,
    universe: &mut HashMap<String, Vec<Bar>>,
) -> Result<Vec<Bar>> {
    match path {
        Some(path) => Ok(select_index(load_bars(path)?, index_symbol)),
        None => Ok(universe.remove(index_symbol).unwrap_or_default()),
    }
}

/// A single bar file, or every bar file in a directory.
pub fn load_universe(path: &Path) -> Result<HashMap<String, Vec<Bar>>> {
    if path.is_dir() {
        return load_directory(path);
    }
    let mut by_symbol: HashMap<String, Vec<Bar>> = HashMap::new();
    for bar in load_bars(path)? {
        by_symbol.entry(bar.symbol.clone()).or_default().push(bar);
    }
    Ok(by_symbol)
}

pub fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to encode JSON output")?;
    fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_parameters_accept_numbers_and_booleans() {
        let params =
            parse_parameters(Some(r#"{"channel_period": 30, "require_index_condition": false}"#))
                .unwrap();
        assert_eq!(params["channel_period"], 30.0);
        assert_eq!(params["require_index_condition"], 0.0);
        assert!(parse_parameters(None).unwrap().is_empty());
    }

    #[test]
    fn index_symbol_is_taken_out_of_the_universe() {
        let bar = |symbol: &str| Bar {
            symbol: symbol.to_string(),
            date: chrono::NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 0.0,
        };
        let mut universe = HashMap::new();
        universe.insert("AAA".to_string(), vec![bar("AAA")]);
        universe.insert("000300.SH".to_string(), vec![bar("000300.SH")]);

        let index = load_index(None, "000300.SH", &mut universe).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index[0].symbol, "000300.SH");
        assert_eq!(universe.len(), 1);
        assert!(universe.contains_key("AAA"));

        assert!(load_index(None, "399001.SZ", &mut universe).unwrap().is_empty());
    }

    #[test]
    fn non_numeric_parameter_is_rejected() {
        let err = parse_parameters(Some(r#"{"channel_period": "wide"}"#)).unwrap_err();
        assert!(err.to_string().contains("channel_period"));
        assert!(parse_parameters(Some("[1, 2]")).is_err());
    }
}
