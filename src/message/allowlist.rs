use regex::Regex;

use crate::BatchmailError;

/// Wildcard address masks restricting who may receive mail.
///
/// `*` matches zero or more characters; every other character is literal.
/// An empty list allows everyone.
#[derive(Debug, Clone, Default)]
pub struct AddressAllowList {
    masks: Vec<Regex>,
}

impl AddressAllowList {
    pub fn new<S: AsRef<str>>(masks: &[S]) -> crate::Result<Self> {
        let masks = masks
            .iter()
            .map(|m| compile_mask(m.as_ref()))
            .collect::<crate::Result<Vec<_>>>()?;
        Ok(Self { masks })
    }

    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }

    pub fn allows(&self, address: &str) -> bool {
        self.is_empty() || self.masks.iter().any(|m| m.is_match(address))
    }

    /// Check every address of a comma-separated recipient field.
    ///
    /// Fails on the first address no mask matches.
    pub fn check(&self, recipients: &str) -> crate::Result<()> {
        for address in split_recipients(recipients) {
            if !self.allows(address) {
                return Err(BatchmailError::RecipientNotAllowed {
                    address: address.to_string(),
                });
            }
        }
        Ok(())
    }
}

fn compile_mask(mask: &str) -> crate::Result<Regex> {
    let pattern = format!("^{}$", regex::escape(mask).replace(r"\*", ".*"));
    Regex::new(&pattern).map_err(|e| BatchmailError::InvalidMask {
        mask: mask.to_string(),
        reason: e.to_string(),
    })
}

/// Individual addresses of a possibly comma-separated recipient field.
pub fn split_recipients(field: &str) -> impl Iterator<Item = &str> {
    field.split(',').map(str::trim).filter(|a| !a.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_list_allows_everyone() {
        let list = AddressAllowList::default();
        assert!(list.check("anyone@anywhere.org").is_ok());
    }

    #[test]
    fn test_wildcard_matches_zero_or_more() {
        let list = AddressAllowList::new(&["*@example.com", "boss@corp.*"]).unwrap();
        assert!(list.allows("user@example.com"));
        assert!(list.allows("@example.com"));
        assert!(list.allows("boss@corp.io"));
        assert!(!list.allows("user@example.com.evil"));
        assert!(!list.allows("user@other.com"));
    }

    #[test]
    fn test_dots_are_literal() {
        let list = AddressAllowList::new(&["a@example.com"]).unwrap();
        assert!(!list.allows("a@exampleXcom"));
    }

    #[test]
    fn test_all_listed_recipients_must_match() {
        let list = AddressAllowList::new(&["*@example.com"]).unwrap();
        let err = list
            .check("user@example.com, user@other.com")
            .unwrap_err();
        assert!(
            matches!(err, BatchmailError::RecipientNotAllowed { ref address } if address == "user@other.com")
        );
        assert!(list.check("a@example.com,b@example.com").is_ok());
    }

    #[test]
    fn test_split_recipients_trims_and_drops_empty() {
        let parts: Vec<&str> = split_recipients(" a@x.com, ,b@y.com ").collect();
        assert_eq!(parts, vec!["a@x.com", "b@y.com"]);
    }
}
