// Query filtering over indexed record fields

/// Filter for querying records
///
/// Only records that carry the field match, so `Ne` skips records
/// where the field is absent.
#[derive(Debug, Clone)]
pub struct Filter {
    /// Field name to filter on
    pub field: String,
    /// Comparison operator
    pub op: FilterOp,
    /// Value to compare against
    pub value: String,
}

/// Comparison operators for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,       // ==
    Ne,       // !=
    Contains, // LIKE %value%
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }

    pub fn ne(field: &str, value: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            op: FilterOp::Ne,
            value: value.into(),
        }
    }

    pub fn contains(field: &str, value: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            op: FilterOp::Contains,
            value: value.into(),
        }
    }

    /// Value as bound into the SQL comparison
    pub(crate) fn bind_value(&self) -> String {
        match self.op {
            FilterOp::Contains => {
                let escaped = self
                    .value
                    .replace('\\', "\\\\")
                    .replace('%', "\\%")
                    .replace('_', "\\_");
                format!("%{}%", escaped)
            }
            _ => self.value.clone(),
        }
    }
}

impl FilterOp {
    pub(crate) fn to_sql(self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Ne => "!=",
            FilterOp::Contains => "LIKE",
        }
    }
}

impl std::fmt::Display for FilterOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterOp::Eq => write!(f, "="),
            FilterOp::Ne => write!(f, "!="),
            FilterOp::Contains => write!(f, "contains"),
        }
    }
}
