//! Single-pass grouping over an ordered row stream.
//!
//! Rows arrive sorted by some key. [`Grouped::next_group`] hands out one
//! [`Group`] at a time that yields the rows sharing the current key straight
//! from the underlying cursor. Nothing is buffered; rows a caller leaves
//! unread are skipped when the next group is requested.

use std::iter::Peekable;

pub struct Grouped<I: Iterator, F, K> {
    rows: Peekable<I>,
    key_of: F,
    current: Option<K>,
}

impl<I, F, T, E, K> Grouped<I, F, K>
where
    I: Iterator<Item = Result<T, E>>,
    F: FnMut(&T) -> K,
    K: PartialEq + Clone,
{
    pub fn new(rows: I, key_of: F) -> Self {
        Self {
            rows: rows.peekable(),
            key_of,
            current: None,
        }
    }

    /// Start the next group, or report the error that ended the stream
    pub fn next_group(&mut self) -> Option<Result<Group<'_, I, F, K>, E>> {
        self.skip_current();

        let key = match self.rows.peek()? {
            Ok(row) => (self.key_of)(row),
            Err(_) => {
                return match self.rows.next()? {
                    Err(e) => Some(Err(e)),
                    Ok(_) => None,
                }
            }
        };

        self.current = Some(key.clone());
        Some(Ok(Group { parent: self, key }))
    }

    fn skip_current(&mut self) {
        let Some(current) = self.current.take() else {
            return;
        };
        while let Some(Ok(row)) = self.rows.peek() {
            if (self.key_of)(row) != current {
                break;
            }
            self.rows.next();
        }
    }
}

/// Rows of one key, read from the shared cursor
pub struct Group<'a, I: Iterator, F, K> {
    parent: &'a mut Grouped<I, F, K>,
    key: K,
}

impl<I: Iterator, F, K> Group<'_, I, F, K> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<I, F, T, E, K> Iterator for Group<'_, I, F, K>
where
    I: Iterator<Item = Result<T, E>>,
    F: FnMut(&T) -> K,
    K: PartialEq,
{
    type Item = Result<T, E>;

    fn next(&mut self) -> Option<Self::Item> {
        let same = match self.parent.rows.peek()? {
            Ok(row) => (self.parent.key_of)(row) == self.key,
            Err(_) => true,
        };
        if same {
            self.parent.rows.next()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Row = (&'static str, u32);

    fn rows(data: Vec<Row>) -> impl Iterator<Item = Result<Row, String>> {
        data.into_iter().map(Ok)
    }

    #[test]
    fn test_groups_in_order() {
        let mut grouped = Grouped::new(
            rows(vec![("a", 1), ("a", 2), ("b", 3), ("c", 4), ("c", 5)]),
            |r: &Row| r.0,
        );

        let mut seen = Vec::new();
        while let Some(group) = grouped.next_group() {
            let group = group.unwrap();
            let key = *group.key();
            let values: Vec<u32> = group.map(|r| r.unwrap().1).collect();
            seen.push((key, values));
        }

        assert_eq!(
            seen,
            vec![("a", vec![1, 2]), ("b", vec![3]), ("c", vec![4, 5])]
        );
    }

    #[test]
    fn test_unread_rows_are_skipped() {
        let mut grouped = Grouped::new(
            rows(vec![("a", 1), ("a", 2), ("a", 3), ("b", 4)]),
            |r: &Row| r.0,
        );

        {
            let mut first = grouped.next_group().unwrap().unwrap();
            assert_eq!(first.next().unwrap().unwrap().1, 1);
        }

        let second = grouped.next_group().unwrap().unwrap();
        assert_eq!(*second.key(), "b");
        drop(second);
        assert!(grouped.next_group().is_none());
    }

    #[test]
    fn test_error_is_surfaced() {
        let data: Vec<Result<Row, String>> =
            vec![Ok(("a", 1)), Err("cursor failed".to_string()), Ok(("b", 2))];
        let mut grouped = Grouped::new(data.into_iter(), |r: &Row| r.0);

        let mut group = grouped.next_group().unwrap().unwrap();
        assert!(group.next().unwrap().is_ok());
        assert_eq!(group.next().unwrap().unwrap_err(), "cursor failed");
    }

    #[test]
    fn test_empty_stream() {
        let mut grouped = Grouped::new(rows(Vec::new()), |r: &Row| r.0);
        assert!(grouped.next_group().is_none());
    }
}
