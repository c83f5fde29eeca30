use std::fmt::Write as _;

/// Cells wider than this are cut and suffixed with `...`.
pub const MAX_CELL_WIDTH: usize = 40;

const COLUMN_GAP: &str = "  ";

pub fn render_table(headers: &[String], rows: &[Vec<String>]) -> String {
    let cleaned: Vec<Vec<String>> = rows
        .iter()
        .map(|row| row.iter().take(headers.len()).map(|cell| clean_cell(cell)).collect())
        .collect();
    let headers: Vec<String> = headers.iter().map(|h| clean_cell(h)).collect();

    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count().max(3)).collect();
    for row in &cleaned {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut output = String::new();
    let _ = writeln!(output, "{}", join_padded(&headers, &widths));
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    let _ = writeln!(output, "{}", join_padded(&rule, &widths));
    for row in &cleaned {
        let _ = writeln!(output, "{}", join_padded(row, &widths));
    }
    output
}

pub fn print_table(headers: &[String], rows: &[Vec<String>]) {
    print!("{}", render_table(headers, rows));
}

fn join_padded(cells: &[String], widths: &[usize]) -> String {
    let line = widths
        .iter()
        .enumerate()
        .map(|(idx, width)| {
            let cell = cells.get(idx).map(String::as_str).unwrap_or("");
            format!("{cell:<width$}")
        })
        .collect::<Vec<_>>()
        .join(COLUMN_GAP);
    line.trim_end().to_string()
}

fn clean_cell(value: &str) -> String {
    let flat: String = value
        .chars()
        .map(|ch| if ch.is_control() { ' ' } else { ch })
        .collect();
    if flat.chars().count() <= MAX_CELL_WIDTH {
        return flat;
    }
    let mut cut: String = flat.chars().take(MAX_CELL_WIDTH - 3).collect();
    cut.push_str("...");
    cut
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligns_columns_and_trims_trailing_space() {
        let headers = vec!["id".to_string(), "symptoms".to_string()];
        let rows = vec![
            vec!["1".to_string(), "fever".to_string()],
            vec!["22".to_string(), "".to_string()],
        ];
        let rendered = render_table(&headers, &rows);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "id   symptoms");
        assert_eq!(lines[1], "---  --------");
        assert_eq!(lines[2], "1    fever");
        assert_eq!(lines[3], "22");
    }

    #[test]
    fn long_and_multiline_cells_are_flattened() {
        let headers = vec!["note".to_string()];
        let rows = vec![vec![format!("line one\nline two {}", "x".repeat(60))]];
        let rendered = render_table(&headers, &rows);
        let body = rendered.lines().nth(2).unwrap();
        assert!(body.starts_with("line one line two"));
        assert!(body.ends_with("..."));
        assert_eq!(body.chars().count(), MAX_CELL_WIDTH);
    }
}
