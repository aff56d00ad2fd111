use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    TypeMismatch { message: String },
    OutOfRangeConversion { value: String, target: String },
    UnknownMember { owner: String, name: String },
    BadCallbackState { state: &'static str },
    ProtectedRegistration { ty: String },
    UnsupportedAbi { ty: String },
    ArgumentCount { expected: usize, got: usize },
    DivisionByZero,
    LibraryLoad { name: String, reason: String },
    HostError { message: String },
    InvalidConfig { reason: String },
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TypeMismatch { message } => write!(f, "{}", message),
            Self::OutOfRangeConversion { value, target } => {
                write!(f, "value {} out of range for '{}'", value, target)
            }
            Self::UnknownMember { owner, name } => {
                write!(f, "'{}' has no member named '{}'", owner, name)
            }
            Self::BadCallbackState { state } => {
                write!(f, "bad callback ({})", state)
            }
            Self::ProtectedRegistration { ty } => {
                write!(f, "cannot change a protected metatable of '{}'", ty)
            }
            Self::UnsupportedAbi { ty } => {
                write!(f, "'{}' has no native ABI representation", ty)
            }
            Self::ArgumentCount { expected, got } => {
                write!(f, "wrong number of arguments: expected {}, got {}", expected, got)
            }
            Self::DivisionByZero => write!(f, "integer division by zero"),
            Self::LibraryLoad { name, reason } => {
                write!(f, "cannot load library '{}': {}", name, reason)
            }
            Self::HostError { message } => write!(f, "{}", message),
            Self::InvalidConfig { reason } => write!(f, "invalid configuration: {}", reason),
        }
    }
}

/// Error raised by any engine operation.
///
/// The first violated contract is reported as-is; nothing is retried.
#[derive(Debug, Clone)]
pub struct FfiError {
    pub kind: ErrorKind,
    pub suggestions: Vec<String>,
}

pub type FfiResult<T> = Result<T, FfiError>;

impl FfiError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: String) -> Self {
        self.suggestions.push(suggestion);
        self
    }

    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions = suggestions;
        self
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TypeMismatch {
            message: message.into(),
        })
    }

    /// `cannot convert 'from' to 'to'`
    pub fn conversion(from: &str, to: &str) -> Self {
        Self::type_mismatch(format!("cannot convert '{}' to '{}'", from, to))
    }

    pub fn not_indexable(ty: &str) -> Self {
        Self::type_mismatch(format!("'{}' is not indexable", ty))
    }

    pub fn not_callable(ty: &str) -> Self {
        Self::type_mismatch(format!("'{}' is not callable", ty))
    }

    pub fn out_of_range(value: impl fmt::Display, target: &str) -> Self {
        Self::new(ErrorKind::OutOfRangeConversion {
            value: value.to_string(),
            target: target.to_string(),
        })
    }

    pub fn unknown_member(owner: &str, name: &str, candidates: &[String]) -> Self {
        let error = Self::new(ErrorKind::UnknownMember {
            owner: owner.to_string(),
            name: name.to_string(),
        });

        let similar = find_similar_names(name, candidates, 2);
        if similar.is_empty() {
            return error;
        }
        error.with_suggestions(
            similar
                .iter()
                .take(3)
                .map(|s| format!("Did you mean '{}'?", s))
                .collect(),
        )
    }

    pub fn bad_callback(state: &'static str) -> Self {
        Self::new(ErrorKind::BadCallbackState { state })
    }

    pub fn unsupported_abi(ty: &str) -> Self {
        Self::new(ErrorKind::UnsupportedAbi { ty: ty.to_string() })
    }

    pub fn host(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::HostError {
            message: message.into(),
        })
    }

    pub fn is_type_mismatch(&self) -> bool {
        matches!(self.kind, ErrorKind::TypeMismatch { .. })
    }
}

impl fmt::Display for FfiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;

        for suggestion in &self.suggestions {
            write!(f, "\n  hint: {}", suggestion)?;
        }

        Ok(())
    }
}

impl std::error::Error for FfiError {}

impl From<ErrorKind> for FfiError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

/// Compute Levenshtein distance for "did you mean" suggestions
pub fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();

    if a_chars.is_empty() {
        return b_chars.len();
    }
    if b_chars.is_empty() {
        return a_chars.len();
    }

    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut cur = vec![0; b_chars.len() + 1];

    for (i, ca) in a_chars.iter().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != cb);
            cur[j + 1] = (prev[j + 1] + 1).min(cur[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut cur);
    }

    prev[b_chars.len()]
}

/// Find similar names for "did you mean" suggestions
pub fn find_similar_names(target: &str, candidates: &[String], max_distance: usize) -> Vec<String> {
    let mut results: Vec<(String, usize)> = candidates
        .iter()
        .map(|c| (c.clone(), levenshtein_distance(target, c)))
        .filter(|(_, dist)| *dist <= max_distance && *dist > 0)
        .collect();

    results.sort_by_key(|(_, dist)| *dist);
    results.into_iter().map(|(name, _)| name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein_distance("kitten", "sitting"), 3);
        assert_eq!(levenshtein_distance("", "abc"), 3);
        assert_eq!(levenshtein_distance("same", "same"), 0);
    }

    #[test]
    fn test_unknown_member_suggests() {
        let fields = vec!["x".to_string(), "y".to_string(), "width".to_string()];
        let err = FfiError::unknown_member("struct rect", "widht", &fields);
        assert_eq!(err.suggestions, vec!["Did you mean 'width'?".to_string()]);
        assert!(err.to_string().starts_with("'struct rect' has no member named 'widht'"));
    }

    #[test]
    fn test_display_kinds() {
        let err = FfiError::out_of_range(300, "unsigned char");
        assert_eq!(err.to_string(), "value 300 out of range for 'unsigned char'");
        assert_eq!(
            FfiError::not_indexable("int").to_string(),
            "'int' is not indexable"
        );
    }
}
