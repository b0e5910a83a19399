//! Word count.

use crate::KeyValue;

pub fn map(_filename: &str, contents: &str) -> Vec<KeyValue> {
    contents
        .split_whitespace()
        .map(|w| KeyValue::new(w, "1"))
        .collect()
}

pub fn reduce(_key: &str, values: &[String]) -> String {
    values.len().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wc() {
        let kvs = map("f", "the cat\n the  hat ");
        assert_eq!(kvs.len(), 4);
        assert_eq!(kvs[2], KeyValue::new("the", "1"));
        assert_eq!(reduce("the", &["1".into(), "1".into()]), "2");
    }
}
