#[cfg(feature = "debug")]
use std::io::{self, Write};

#[cfg(feature = "debug")]
const MIN_WIDTH: usize = 5;

#[cfg(feature = "debug")]
const PADDING: usize = 1;

#[cfg(feature = "debug")]
const FLOAT_CONFIG: pretty_dtoa::FmtFloatConfig = pretty_dtoa::FmtFloatConfig::default()
    .add_point_zero(false)
    .max_significant_digits(6);

/// Right-aligned text rendering of a tile; exact zeros print as `-`.
#[cfg(feature = "debug")]
pub fn matrix_table<S: crate::Scalar>(t: &crate::Tile<S>) -> crate::Result<String> {
    let mut tw = tabwriter::TabWriter::new(vec![])
        .minwidth(MIN_WIDTH)
        .padding(PADDING)
        .alignment(tabwriter::Alignment::Right);

    let values = t.to_vec()?;
    let (m, n) = (t.rows(), t.cols());

    for r in 0..m {
        for c in 0..n {
            let x = values[c * m + r];
            if x == S::zero() {
                tw.write_all(b"-")?;
            } else {
                tw.write_all(x.pretty_string(FLOAT_CONFIG).as_bytes())?;
            }
            if c == n - 1 {
                tw.write_all(b"\t\n")?;
            } else {
                tw.write_all(b"\t")?;
            }
        }
    }
    let bytes = tw
        .into_inner()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "table flush failed"))?;
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e).into())
}

/// `trace!` a tile as a table.
#[cfg(feature = "debug")]
macro_rules! trace_tile {
    ($name:expr, $tile:expr) => {
        if let Ok(table) = crate::debug::matrix_table($tile) {
            tracing::trace!("{} =\n{}", $name, table);
        }
    };
}

#[cfg(not(feature = "debug"))]
macro_rules! trace_tile {
    ($name:expr, $tile:expr) => {};
}

pub(crate) use trace_tile;

#[cfg(all(test, feature = "debug"))]
mod tests {
    use super::*;
    use crate::Tile;

    #[test]
    fn zeros_are_dashes() {
        let t = Tile::from_col_major(2, 2, vec![1.5, 0.0, 0.0, -2.0]);
        let s = matrix_table(&t).unwrap();
        let lines: Vec<&str> = s.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("1.5") && lines[0].trim_end().ends_with('-'));
        assert!(lines[1].contains("-2"));
    }
}
