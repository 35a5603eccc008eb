//! Result type alias for the export pipeline

use super::errors::IasoError;

/// Result type alias using [`IasoError`]
///
/// # Examples
///
/// ```
/// use iaso_export::domain::{IasoError, Result};
///
/// fn page_size(raw: usize) -> Result<usize> {
///     if raw == 0 {
///         return Err(IasoError::Validation("page size must be positive".to_string()));
///     }
///     Ok(raw)
/// }
///
/// assert!(page_size(0).is_err());
/// ```
pub type Result<T> = std::result::Result<T, IasoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_with_question_mark() -> Result<()> {
        fn inner() -> Result<u64> {
            Ok(3)
        }

        assert_eq!(inner()?, 3);
        Ok(())
    }

    #[test]
    fn test_result_err() {
        let result: Result<()> = Err(IasoError::NothingToExport);
        assert!(matches!(result, Err(IasoError::NothingToExport)));
    }
}
