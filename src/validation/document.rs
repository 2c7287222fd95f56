use garde::Validate;

use crate::error::{Result, StoreError};

/// Largest page a caller may request from `DocumentStore::get_by_user_id`.
pub const MAX_PAGE_SIZE: i64 = 500;

/// A 1-indexed page window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Validate)]
pub struct PageRequest {
    #[garde(range(min = 1))]
    pub page: i64,
    #[garde(range(min = 1, max = 500))]
    pub page_size: i64,
}

impl PageRequest {
    /// Validates the window.
    ///
    /// # Arguments
    ///
    /// * `page` - The 1-indexed page number.
    /// * `page_size` - The number of records per page.
    ///
    /// # Returns
    ///
    /// A `Result` containing the validated `PageRequest`.
    pub fn new(page: i64, page_size: i64) -> Result<Self> {
        let request = Self { page, page_size };
        request
            .validate()
            .map_err(|report| StoreError::Validation(report.to_string()))?;

        if (page - 1).checked_mul(page_size).is_none() {
            return Err(StoreError::Validation(format!(
                "page: {page} is past the last addressable row for page_size {page_size}"
            )));
        }
        Ok(request)
    }

    /// Rows skipped before this page. Saturates for a window built by hand.
    pub fn offset(&self) -> i64 {
        self.page.saturating_sub(1).saturating_mul(self.page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_is_zero_based() {
        assert_eq!(PageRequest::new(1, 10).unwrap().offset(), 0);
        assert_eq!(PageRequest::new(2, 10).unwrap().offset(), 10);
    }

    #[test]
    fn out_of_range_windows_are_rejected() {
        for (page, size) in [(0, 10), (-1, 10), (1, 0), (1, MAX_PAGE_SIZE + 1)] {
            assert!(matches!(
                PageRequest::new(page, size),
                Err(StoreError::Validation(_))
            ));
        }
        assert!(PageRequest::new(1, MAX_PAGE_SIZE).is_ok());
    }

    #[test]
    fn page_past_addressable_rows_is_rejected() {
        assert!(matches!(
            PageRequest::new(i64::MAX, MAX_PAGE_SIZE),
            Err(StoreError::Validation(_))
        ));
        // Largest page whose offset still fits.
        let last = i64::MAX / MAX_PAGE_SIZE + 1;
        assert_eq!(
            PageRequest::new(last, MAX_PAGE_SIZE).unwrap().offset(),
            (last - 1) * MAX_PAGE_SIZE
        );
    }

    #[test]
    fn hand_built_window_offset_saturates() {
        let window = PageRequest {
            page: i64::MAX,
            page_size: MAX_PAGE_SIZE,
        };
        assert_eq!(window.offset(), i64::MAX);
    }
}
