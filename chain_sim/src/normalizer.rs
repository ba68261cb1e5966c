use crate::grid::Grid;

pub const DEFAULT_MAX_RELIEF: f64 = 2000.0;

/// Convert an absolute-level grid into water height above `base`.
///
/// A cell is no-data when either input is no-data at that position, or when the
/// relief falls outside `[0, max_relief)`. The result carries the base grid's
/// parameters.
pub fn normalize(raw: &Grid, base: &Grid, max_relief: f64) -> Grid {
    let no_data = base.params.no_data_value;
    let cells = (0..base.rows())
        .map(|row| {
            let base_row = &base.cells[row];
            (0..base_row.len())
                .map(|col| {
                    let relief = match (base.value(row, col), raw.value(row, col)) {
                        (Some(reference), Some(level)) => level - reference,
                        _ => return no_data,
                    };
                    if (0.0..max_relief).contains(&relief) {
                        relief
                    } else {
                        no_data
                    }
                })
                .collect()
        })
        .collect();
    Grid::from_cells(base.params.clone(), cells)
}

/// Serialize a relief grid under the verbatim `header` of its base grid.
pub fn relief_grid_text(header: &[String], grid: &Grid) -> String {
    let mut text = String::new();
    for line in header {
        text.push_str(line);
        text.push('\n');
    }
    let body = grid
        .cells
        .iter()
        .map(|row| {
            row.iter()
                .map(|value| value.to_string())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n");
    text.push_str(&body);
    text
}
