use std::fmt::{self, Display, Write};

const PADDING: usize = 3;

/// A column of a [`Table`], rendering each row with `value`.
pub struct Column<T> {
    header: &'static str,
    value: Box<dyn Fn(&T) -> String>,
}

/// Left-aligned plain-text table. Each column is as wide as its widest cell plus padding.
pub struct Table<'a, T> {
    pub cols: Vec<Column<T>>,
    pub data: &'a [T],
}

impl<T> Column<T> {
    pub fn new(header: &'static str, value: impl Fn(&T) -> String + 'static) -> Self {
        Self {
            header,
            value: Box::new(value),
        }
    }

    fn width(&self, rows: &[T]) -> usize {
        rows.iter()
            .map(|t| (self.value)(t).chars().count())
            .fold(self.header.len(), usize::max)
            + PADDING
    }
}

impl<T> Display for Table<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let widths = self
            .cols
            .iter()
            .map(|col| col.width(self.data))
            .collect::<Vec<_>>();

        for (col, width) in self.cols.iter().zip(&widths) {
            write!(f, "{:width$}", col.header, width = width)?;
        }
        f.write_char('\n')?;

        for row in self.data {
            for (col, width) in self.cols.iter().zip(&widths) {
                write!(f, "{:width$}", (col.value)(row), width = width)?;
            }
            f.write_char('\n')?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_to_widest_cell() {
        let rows = vec![("a", 1), ("longer", 22)];
        let table = Table {
            cols: vec![
                Column::new("NAME", |r: &(&str, i32)| r.0.to_string()),
                Column::new("N", |r: &(&str, i32)| r.1.to_string()),
            ],
            data: &rows,
        };
        assert_eq!(
            table.to_string(),
            "NAME     N    \na        1    \nlonger   22   \n"
        );
    }

    #[test]
    fn empty_table_prints_headers() {
        let rows: Vec<String> = vec![];
        let table = Table {
            cols: vec![Column::new("NAME", |r: &String| r.clone())],
            data: &rows,
        };
        assert_eq!(table.to_string(), "NAME   \n");
    }
}
