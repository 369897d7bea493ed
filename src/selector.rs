//! Non-spatial dimension selectors (§3 "Selector") and their stable hash.

use std::collections::BTreeMap;
use std::fmt::Write as _;

/// One dimension's selection: a single value, an explicit index, or a list (which opens a
/// band set for a custom fragment shader, §3).
#[derive(Debug, Clone, PartialEq)]
pub enum SelectorValue {
    Value(CoordValue),
    Index(usize),
    List(Vec<CoordValue>),
}

/// A coordinate-array value a selector can match against. Numeric values produce band names
/// `"<dim>_<v>"`; string values are used verbatim as the band name (§3, §8).
#[derive(Debug, Clone, PartialEq)]
pub enum CoordValue {
    Number(f64),
    Text(String),
}

impl CoordValue {
    fn band_name(&self, dim: &str) -> String {
        match self {
            CoordValue::Number(n) => format!("{dim}_{n}"),
            CoordValue::Text(s) => s.clone(),
        }
    }

    fn stable_string(&self) -> String {
        match self {
            CoordValue::Number(n) => format!("{n}"),
            CoordValue::Text(s) => s.clone(),
        }
    }
}

/// Map from non-spatial dimension name to its selection, the unit the tile/untiled managers
/// and the shader composer's band list are all built from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selector(BTreeMap<String, SelectorValue>);

impl Selector {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn set(&mut self, dim: impl Into<String>, value: SelectorValue) {
        self.0.insert(dim.into(), value);
    }

    pub fn get(&self, dim: &str) -> Option<&SelectorValue> {
        self.0.get(dim)
    }

    pub fn dims(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Band names this selector produces for `dim`, if `dim` carries a list selector.
    /// Numeric list elements become `"<dim>_<v>"`; string elements are used verbatim (§8).
    pub fn band_names(&self, dim: &str) -> Vec<String> {
        match self.0.get(dim) {
            Some(SelectorValue::List(values)) => {
                values.iter().map(|v| v.band_name(dim)).collect()
            }
            _ => Vec::new(),
        }
    }

    /// The dimension carrying a list selector, if any — list selectors are exclusive across
    /// dimensions in this engine (one band set per frame, §3 tile identity invariant).
    pub fn band_dim(&self) -> Option<&str> {
        self.0
            .iter()
            .find(|(_, v)| matches!(v, SelectorValue::List(_)))
            .map(|(k, _)| k.as_str())
    }

    /// Stable string encoding used as the tile/region cache key (§4.C "selector hash").
    /// Sorted `dim=value` pairs since `BTreeMap` already iterates in key order.
    pub fn hash(&self) -> String {
        let mut out = String::new();
        for (i, (dim, value)) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(';');
            }
            let _ = write!(out, "{dim}=");
            match value {
                SelectorValue::Value(v) => out.push_str(&v.stable_string()),
                SelectorValue::Index(idx) => {
                    let _ = write!(out, "#{idx}");
                }
                SelectorValue::List(values) => {
                    out.push('[');
                    for (j, v) in values.iter().enumerate() {
                        if j > 0 {
                            out.push(',');
                        }
                        out.push_str(&v.stable_string());
                    }
                    out.push(']');
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_order_independent_of_insertion() {
        let mut a = Selector::new();
        a.set("time", SelectorValue::Index(10));
        a.set("band", SelectorValue::Value(CoordValue::Text("tavg".into())));

        let mut b = Selector::new();
        b.set("band", SelectorValue::Value(CoordValue::Text("tavg".into())));
        b.set("time", SelectorValue::Index(10));

        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn hash_changes_with_value() {
        let mut a = Selector::new();
        a.set("time", SelectorValue::Index(10));
        let mut b = Selector::new();
        b.set("time", SelectorValue::Index(11));
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn band_names_numeric_vs_text() {
        let mut sel = Selector::new();
        sel.set(
            "band",
            SelectorValue::List(vec![
                CoordValue::Text("tavg".into()),
                CoordValue::Text("prec".into()),
            ]),
        );
        assert_eq!(sel.band_names("band"), vec!["tavg", "prec"]);

        let mut sel2 = Selector::new();
        sel2.set(
            "month",
            SelectorValue::List(vec![CoordValue::Number(1.0), CoordValue::Number(2.0)]),
        );
        assert_eq!(sel2.band_names("month"), vec!["month_1", "month_2"]);
    }

    #[test]
    fn band_dim_finds_the_list_selector() {
        let mut sel = Selector::new();
        sel.set("time", SelectorValue::Index(0));
        sel.set(
            "band",
            SelectorValue::List(vec![CoordValue::Text("a".into())]),
        );
        assert_eq!(sel.band_dim(), Some("band"));
    }
}
