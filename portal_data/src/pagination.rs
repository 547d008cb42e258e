use std::num::IntErrorKind;

use serde::Serialize;

/// Page slicing over `count` rows, 1-based page numbers.
///
/// Unlike a strict paginator this never fails: a `page` parameter that is missing or not a
/// number gives the first page, numbers outside `1..=num_pages` are clamped to the nearest
/// end. An empty listing still has one (empty) page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Paginator {
    count: u64,
    per_page: u64,
}

/// Rows to fetch for one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSlice {
    pub number: u64,
    pub offset: u64,
    pub limit: u64,
}

impl Paginator {
    pub fn new(count: u64, per_page: u64) -> Self {
        Self {
            count,
            per_page: per_page.max(1),
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn num_pages(&self) -> u64 {
        self.count.div_ceil(self.per_page).max(1)
    }

    /// Numbers too large for an integer still mean "past the end".
    pub fn page_number(&self, raw: Option<&str>) -> u64 {
        let Some(raw) = raw else { return 1 };
        match raw.trim().parse::<i64>() {
            Ok(requested) => u64::try_from(requested).map_or(1, |number| number.clamp(1, self.num_pages())),
            Err(e) => match e.kind() {
                IntErrorKind::PosOverflow => self.num_pages(),
                _ => 1,
            },
        }
    }

    pub fn slice(&self, raw: Option<&str>) -> PageSlice {
        let number = self.page_number(raw);
        PageSlice {
            number,
            offset: (number - 1) * self.per_page,
            limit: self.per_page,
        }
    }

    pub fn page<T>(&self, slice: PageSlice, items: Vec<T>) -> Page<T> {
        Page {
            number: slice.number,
            num_pages: self.num_pages(),
            count: self.count,
            has_previous: slice.number > 1,
            has_next: slice.number < self.num_pages(),
            items,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub number: u64,
    pub num_pages: u64,
    pub count: u64,
    pub has_previous: bool,
    pub has_next: bool,
    pub items: Vec<T>,
}

#[allow(non_snake_case)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn Paginator__num_pages() {
        assert_eq!(Paginator::new(0, 100).num_pages(), 1);
        assert_eq!(Paginator::new(1, 100).num_pages(), 1);
        assert_eq!(Paginator::new(100, 100).num_pages(), 1);
        assert_eq!(Paginator::new(101, 100).num_pages(), 2);
        assert_eq!(Paginator::new(250, 100).num_pages(), 3);
    }

    #[test]
    fn Paginator__page_number__clamps() {
        let paginator = Paginator::new(250, 100);
        assert_eq!(paginator.page_number(Some("2")), 2);
        assert_eq!(paginator.page_number(Some("3")), 3);
        assert_eq!(paginator.page_number(Some("4")), 3);
        assert_eq!(paginator.page_number(Some("999999999999")), 3);
        assert_eq!(paginator.page_number(Some("0")), 1);
        assert_eq!(paginator.page_number(Some("-5")), 1);
        assert_eq!(paginator.page_number(Some("99999999999999999999")), 3);
        assert_eq!(paginator.page_number(Some("-99999999999999999999")), 1);
        assert_eq!(Paginator::new(0, 100).page_number(Some("99999999999999999999")), 1);
    }

    #[test]
    fn Paginator__page_number__malformed_is_first_page() {
        let paginator = Paginator::new(250, 100);
        assert_eq!(paginator.page_number(None), 1);
        assert_eq!(paginator.page_number(Some("")), 1);
        assert_eq!(paginator.page_number(Some("two")), 1);
        assert_eq!(paginator.page_number(Some("2.5")), 1);
        assert_eq!(paginator.page_number(Some(" 2 ")), 2);
    }

    #[test]
    fn Paginator__slice() {
        let paginator = Paginator::new(250, 100);
        assert_eq!(paginator.slice(Some("3")), PageSlice { number: 3, offset: 200, limit: 100 });
        assert_eq!(Paginator::new(0, 100).slice(Some("7")), PageSlice { number: 1, offset: 0, limit: 100 });
    }

    #[test]
    fn Paginator__page__neighbours() {
        let paginator = Paginator::new(250, 100);
        let last = paginator.page(paginator.slice(Some("9")), vec![1, 2, 3]);
        assert_eq!(last.number, 3);
        assert!(last.has_previous);
        assert!(!last.has_next);

        let only = Paginator::new(0, 100);
        let page = only.page(only.slice(None), Vec::<u8>::new());
        assert!(!page.has_previous && !page.has_next);
        assert_eq!(page.num_pages, 1);
    }
}
