//! Brute-force nearest-neighbour search over record vectors.
//!
//! Distance is cosine distance (`1 - cos θ`), so results fall in `[0, 2]`.
//! Records whose field is missing, not a number array, a different
//! dimension, or all zeros are skipped.

use serde_json::{Value, json};

/// Rank `records` by distance from `query` and keep the closest `top`.
///
/// Ties are broken by record id so results are deterministic.
pub fn search(records: Vec<Value>, query: &[f64], field: &str, top: usize) -> Vec<Value> {
    let Some(query_norm) = norm(query) else {
        return Vec::new();
    };
    let mut hits: Vec<(f64, String, Value)> = records
        .into_iter()
        .filter_map(|record| {
            let candidate = as_vector(record.get(field)?)?;
            if candidate.len() != query.len() {
                return None;
            }
            let candidate_norm = norm(&candidate)?;
            let dot: f64 = query.iter().zip(&candidate).map(|(a, b)| a * b).sum();
            let distance = 1.0 - dot / (query_norm * candidate_norm);
            let id = record.get("id").and_then(Value::as_str).unwrap_or_default().to_owned();
            Some((distance, id, record))
        })
        .collect();

    hits.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    hits.truncate(top);
    hits.into_iter()
        .map(|(distance, id, record)| json!({ "id": id, "distance": distance, "record": record }))
        .collect()
}

/// Parse a JSON number array.
pub fn as_vector(value: &Value) -> Option<Vec<f64>> {
    value.as_array()?.iter().map(Value::as_f64).collect()
}

fn norm(v: &[f64]) -> Option<f64> {
    let n = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    (n > 0.0 && n.is_finite()).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: &str, emb: Value) -> Value {
        json!({"id": id, "emb": emb})
    }

    #[test]
    fn closest_first() {
        let records = vec![
            rec("far", json!([0.0, 1.0])),
            rec("near", json!([1.0, 0.1])),
            rec("exact", json!([2.0, 0.0])),
        ];
        let hits = search(records, &[1.0, 0.0], "emb", 10);
        let ids: Vec<&str> = hits.iter().map(|h| h["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["exact", "near", "far"]);
        assert!(hits[0]["distance"].as_f64().unwrap().abs() < 1e-9);
        assert_eq!(hits[0]["record"]["id"], "exact");
    }

    #[test]
    fn top_truncates() {
        let records = (0..5).map(|i| rec(&format!("r{i}"), json!([1.0, i]))).collect();
        assert_eq!(search(records, &[1.0, 0.0], "emb", 2).len(), 2);
    }

    #[test]
    fn skips_unusable_vectors() {
        let records = vec![
            rec("wrong-dim", json!([1.0, 0.0, 0.0])),
            rec("zero", json!([0.0, 0.0])),
            rec("text", json!("nope")),
            json!({"id": "missing"}),
            rec("ok", json!([1.0, 1.0])),
        ];
        let hits = search(records, &[1.0, 0.0], "emb", 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["id"], "ok");
    }

    #[test]
    fn ties_break_by_id() {
        let records = vec![rec("b", json!([1.0, 0.0])), rec("a", json!([3.0, 0.0]))];
        let hits = search(records, &[1.0, 0.0], "emb", 10);
        assert_eq!(hits[0]["id"], "a");
    }

    #[test]
    fn zero_query_matches_nothing() {
        let records = vec![rec("a", json!([1.0, 0.0]))];
        assert!(search(records, &[0.0, 0.0], "emb", 10).is_empty());
    }
}
