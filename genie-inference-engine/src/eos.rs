#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EosTokenHandler {
    Single(u32),
    Multiple(Vec<u32>),
    None,
}

impl EosTokenHandler {
    /// Builds a handler from the stop tokens a tokenizer actually defines.
    pub fn from_ids(ids: impl IntoIterator<Item = Option<u32>>) -> Self {
        let mut found: Vec<u32> = ids.into_iter().flatten().collect();
        found.sort_unstable();
        found.dedup();
        match found.len() {
            0 => EosTokenHandler::None,
            1 => EosTokenHandler::Single(found[0]),
            _ => EosTokenHandler::Multiple(found),
        }
    }

    pub fn is_eos_token(&self, token_id: u32) -> bool {
        match self {
            EosTokenHandler::Single(id) => token_id == *id,
            EosTokenHandler::Multiple(ids) => ids.contains(&token_id),
            EosTokenHandler::None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_ids_skips_missing_tokens() {
        let handler = EosTokenHandler::from_ids([Some(1), None, Some(107)]);
        assert_eq!(handler, EosTokenHandler::Multiple(vec![1, 107]));
        assert!(handler.is_eos_token(107));
        assert!(!handler.is_eos_token(2));
    }

    #[test]
    fn test_from_ids_single_and_none() {
        assert_eq!(EosTokenHandler::from_ids([Some(1)]), EosTokenHandler::Single(1));
        assert_eq!(EosTokenHandler::from_ids([None]), EosTokenHandler::None);
        assert!(!EosTokenHandler::None.is_eos_token(0));
    }
}
