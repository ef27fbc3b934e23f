//! Terrain layout loading.
//!
//! A layout file carries one line per grid row, each line a comma-separated
//! list of 1-based column indices marking forest cells in that row; unlisted
//! cells are meadow. The first line describes the top row of the map.

use anyhow::{bail, Context, Result};
use foxhare_core::{Cell, TerrainGrid};

/// Parse a layout file into a terrain classification.
pub fn parse_layout(text: &str, width: u32, height: u32) -> Result<TerrainGrid> {
    let mut forest = Vec::new();
    for (row, line) in text.lines().enumerate() {
        if row as u32 >= height {
            bail!("layout has more rows than the grid height {height}");
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // The top layout row maps to the highest y coordinate.
        let y = height as i32 - 1 - row as i32;
        for token in line.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let column: u32 = token.parse().with_context(|| {
                format!("layout row {}: invalid column index {token:?}", row + 1)
            })?;
            if column == 0 || column > width {
                bail!("layout row {}: column {column} outside 1..={width}", row + 1);
            }
            forest.push(Cell::new(column as i32 - 1, y));
        }
    }
    Ok(TerrainGrid::with_forest(width, height, &forest)?)
}

/// Fallback terrain when no layout file is supplied: the eastern third of
/// the grid is forest, the rest meadow.
pub fn default_terrain(width: u32, height: u32) -> Result<TerrainGrid> {
    let mut forest = Vec::new();
    for y in 0..height as i32 {
        for x in (2 * width as i32 / 3)..width as i32 {
            forest.push(Cell::new(x, y));
        }
    }
    Ok(TerrainGrid::with_forest(width, height, &forest)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use foxhare_core::Terrain;

    #[test]
    fn parses_forest_columns_per_row() {
        let grid = parse_layout("1,3\n2\n", 4, 3).expect("layout");
        // Row 0 is the top of the map, y = height - 1.
        assert_eq!(grid.get(Cell::new(0, 2)), Some(Terrain::Forest));
        assert_eq!(grid.get(Cell::new(2, 2)), Some(Terrain::Forest));
        assert_eq!(grid.get(Cell::new(1, 2)), Some(Terrain::Meadow));
        assert_eq!(grid.get(Cell::new(1, 1)), Some(Terrain::Forest));
        assert_eq!(grid.get(Cell::new(0, 0)), Some(Terrain::Meadow));
    }

    #[test]
    fn blank_lines_leave_rows_as_meadow() {
        let grid = parse_layout("\n\n1\n", 2, 3).expect("layout");
        assert_eq!(grid.get(Cell::new(0, 0)), Some(Terrain::Forest));
        assert_eq!(grid.get(Cell::new(0, 2)), Some(Terrain::Meadow));
    }

    #[test]
    fn rejects_columns_outside_the_grid() {
        assert!(parse_layout("5\n", 4, 2).is_err());
        assert!(parse_layout("0\n", 4, 2).is_err());
        assert!(parse_layout("x\n", 4, 2).is_err());
    }

    #[test]
    fn rejects_too_many_rows() {
        assert!(parse_layout("1\n1\n1\n", 2, 2).is_err());
    }

    #[test]
    fn default_terrain_reserves_forest_for_fox_habitats() {
        let grid = default_terrain(9, 3).expect("terrain");
        assert_eq!(grid.get(Cell::new(5, 0)), Some(Terrain::Meadow));
        assert_eq!(grid.get(Cell::new(6, 0)), Some(Terrain::Forest));
        assert_eq!(grid.get(Cell::new(8, 2)), Some(Terrain::Forest));
    }
}
