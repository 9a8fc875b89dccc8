#![forbid(unsafe_code)]

use std::io::{self, Write};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Align {
    #[default]
    Left,
    Right,
}

/// Plain-text table for task and execution listings.
#[derive(Debug, Default)]
pub struct Table {
    headers: Vec<String>,
    align: Vec<Align>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let headers: Vec<String> = headers.into_iter().map(Into::into).collect();
        Self {
            align: vec![Align::Left; headers.len()],
            headers,
            rows: Vec::new(),
        }
    }

    /// Right-aligns the named column (numbers, durations).
    #[must_use]
    pub fn align_right(mut self, header: &str) -> Self {
        if let Some(i) = self.headers.iter().position(|h| h == header) {
            self.align[i] = Align::Right;
        }
        self
    }

    pub fn row(&mut self, cols: impl IntoIterator<Item = impl Into<String>>) {
        self.rows.push(cols.into_iter().map(Into::into).collect());
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn print(&self) -> io::Result<()> {
        self.render(io::stdout().lock())
    }

    pub fn write_csv(&self) -> io::Result<()> {
        self.render_csv(io::stdout().lock())
    }

    pub fn render_csv(&self, out: impl Write) -> io::Result<()> {
        let mut wtr = csv::Writer::from_writer(out);
        wtr.write_record(&self.headers)?;
        for row in &self.rows {
            wtr.write_record(row)?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn render(&self, mut out: impl Write) -> io::Result<()> {
        let widths = self.widths();
        writeln!(out, "{}", self.format_row(&self.headers, &widths))?;
        for row in &self.rows {
            writeln!(out, "{}", self.format_row(row, &widths))?;
        }
        Ok(())
    }

    fn widths(&self) -> Vec<usize> {
        let mut widths: Vec<usize> = self.headers.iter().map(|h| width(h)).collect();
        for row in &self.rows {
            for (i, cell) in row.iter().enumerate() {
                match widths.get_mut(i) {
                    Some(w) => *w = (*w).max(width(cell)),
                    None => widths.push(width(cell)),
                }
            }
        }
        widths
    }

    fn format_row(&self, row: &[String], widths: &[usize]) -> String {
        let mut out = String::new();
        for (i, cell) in row.iter().enumerate() {
            if i > 0 {
                out.push_str("  ");
            }
            let pad = widths.get(i).copied().unwrap_or(0).saturating_sub(width(cell));
            match self.align.get(i).copied().unwrap_or_default() {
                Align::Left => {
                    out.push_str(cell);
                    out.extend(std::iter::repeat_n(' ', pad));
                }
                Align::Right => {
                    out.extend(std::iter::repeat_n(' ', pad));
                    out.push_str(cell);
                }
            }
        }
        out.truncate(out.trim_end().len());
        out
    }
}

// Status icons and ellipses are single-column; wide glyphs are not expected here.
fn width(s: &str) -> usize {
    s.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(t: &Table) -> String {
        let mut buf = Vec::new();
        t.render(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn pads_columns_and_trims_line_ends() {
        let mut t = Table::new(["TASK", "STATUS", "PRIORITY"]).align_right("PRIORITY");
        t.row(["a1b2c3", "running", "80"]);
        t.row(["d4", "waiting", "5"]);
        assert_eq!(
            rendered(&t),
            "TASK    STATUS   PRIORITY\n\
             a1b2c3  running        80\n\
             d4      waiting         5\n"
        );
    }

    #[test]
    fn trailing_left_column_has_no_padding() {
        let mut t = Table::new(["ID", "NAME"]);
        t.row(["1", "Add login form"]);
        t.row(["2", "x"]);
        let out = rendered(&t);
        assert!(out.lines().all(|l| l == l.trim_end()));
        assert!(!t.is_empty());
    }

    #[test]
    fn csv_quotes_cells_with_commas() {
        let mut t = Table::new(["task_id", "dependencies"]);
        t.row(["b", "a, c"]);
        let mut buf = Vec::new();
        t.render_csv(&mut buf).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "task_id,dependencies\nb,\"a, c\"\n");
    }
}
