/// Authenticated operator for a request.
///
/// Inserted by the auth middleware; present on every protected route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorContext {
    operator: String,
}

impl OperatorContext {
    pub fn new(operator: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
        }
    }

    pub fn operator(&self) -> &str {
        &self.operator
    }
}
