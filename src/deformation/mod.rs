//! Weighted sums over lists of deformation values.
//!
//! Both grid and TIN submodels reduce interpolation to the same kernel: a
//! weighted sum of a handful of node rows, projected into the canonical
//! five-slot order `[de, dn, du, eh, ev]`. The [DeformationList] owns the
//! node data as a flat row-major array and performs that reduction.

use crate::Error;

/// The canonical column order: east/north/up displacement, then
/// horizontal/vertical error
pub const DEFORMATION_COLUMNS: [&str; 5] = ["de", "dn", "du", "eh", "ev"];

/// The columns a submodel carries, derived from its displacement and error
/// types. Each type contributes its columns in canonical order.
pub fn deformation_columns(displacement_type: &str, error_type: &str) -> Vec<String> {
    let mut columns = Vec::new();
    if matches!(displacement_type, "horizontal" | "3d") {
        columns.push("de".to_string());
        columns.push("dn".to_string());
    }
    if matches!(displacement_type, "vertical" | "3d") {
        columns.push("du".to_string());
    }
    if matches!(error_type, "horizontal" | "3d") {
        columns.push("eh".to_string());
    }
    if matches!(error_type, "vertical" | "3d") {
        columns.push("ev".to_string());
    }
    columns
}

/// An `N x D` array of deformation values, `D <= 5`. Error columns are
/// squared in place once the list is complete, so that the weighted sums
/// used by interpolation combine variances rather than standard deviations.
#[derive(Clone, Debug)]
pub struct DeformationList {
    // For each canonical slot: the owned column holding it, if any
    mapping: [Option<usize>; 5],
    error_columns: Vec<usize>,
    size: usize,
    dimension: usize,
    nread: usize,
    data: Vec<f64>,
}

impl DeformationList {
    pub fn new(columns: &[String], size: usize) -> Result<DeformationList, Error> {
        if columns.is_empty() {
            return Err(Error::Definition(
                "No deformation columns defined".to_string(),
            ));
        }
        for c in columns {
            if !DEFORMATION_COLUMNS.contains(&c.as_str()) {
                return Err(Error::Definition(format!(
                    "Invalid column {c} of deformation data"
                )));
            }
        }
        if size < 1 {
            return Err(Error::Definition(
                "Invalid size of deformation data list".to_string(),
            ));
        }

        let mut mapping = [None; 5];
        for (slot, name) in DEFORMATION_COLUMNS.iter().enumerate() {
            mapping[slot] = columns.iter().position(|c| c == name);
        }
        let error_columns = ["eh", "ev"]
            .iter()
            .filter_map(|name| columns.iter().position(|c| c == name))
            .collect();

        Ok(DeformationList {
            mapping,
            error_columns,
            size,
            dimension: columns.len(),
            nread: 0,
            data: Vec::new(),
        })
    }

    /// Append one node row. When the final row arrives the error columns
    /// are squared to variances.
    pub fn add_point(&mut self, values: &[f64]) -> Result<(), Error> {
        if self.data.is_empty() {
            self.data = vec![0.0; self.size * self.dimension];
        }
        if self.nread >= self.size {
            return Err(Error::Definition("Too many data points supplied".to_string()));
        }
        if values.len() != self.dimension {
            return Err(Error::Definition(
                "Incorrect number of components at data point".to_string(),
            ));
        }
        let offset = self.nread * self.dimension;
        self.data[offset..offset + self.dimension].copy_from_slice(values);
        self.nread += 1;

        if self.nread == self.size {
            for row in 0..self.size {
                for &ic in &self.error_columns {
                    let i = row * self.dimension + ic;
                    self.data[i] *= self.data[i];
                }
            }
        }
        Ok(())
    }

    /// Install prebuilt data (from the binary cache). The values are the
    /// finalised form, error columns already squared.
    pub fn set_data(&mut self, data: Vec<f64>, rows: usize, cols: usize) -> Result<(), Error> {
        if rows != self.size || cols != self.dimension || data.len() != rows * cols {
            return Err(Error::Definition(
                "Deformation list: supplied data the wrong shape".to_string(),
            ));
        }
        self.data = data;
        self.nread = self.size;
        Ok(())
    }

    pub fn check_valid(&self) -> Result<(), Error> {
        if self.nread != self.size {
            return Err(Error::Definition(format!(
                "Too few data points supplied ({} instead of {})",
                self.nread, self.size
            )));
        }
        Ok(())
    }

    /// The finalised data, row-major
    pub fn data(&self) -> Result<&[f64], Error> {
        self.check_valid()?;
        Ok(&self.data)
    }

    /// The weighted sum `sum(factors[i] * data[rows[i]])`, projected into
    /// the canonical five-slot order with absent columns as zero
    pub fn calc_deformation(&self, rows: &[usize], factors: &[f64]) -> Result<[f64; 5], Error> {
        debug_assert_eq!(self.nread, self.size);
        debug_assert_eq!(rows.len(), factors.len());

        let mut value = vec![0.0; self.dimension];
        for (&row, &factor) in rows.iter().zip(factors.iter()) {
            let offset = row * self.dimension;
            for (v, d) in value.iter_mut().zip(&self.data[offset..offset + self.dimension]) {
                *v += factor * d;
            }
        }
        if value.iter().any(|v| v.is_nan()) {
            return Err(Error::Undefined(
                "The deformation is undefined at this location".to_string(),
            ));
        }

        let mut result = [0.0; 5];
        for (slot, mapped) in self.mapping.iter().enumerate() {
            if let Some(ic) = mapped {
                result[slot] = value[*ic];
            }
        }
        Ok(result)
    }
}

// ----- T E S T S ------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn column_sets() {
        assert_eq!(
            deformation_columns("3d", "3d"),
            columns(&["de", "dn", "du", "eh", "ev"])
        );
        assert_eq!(
            deformation_columns("horizontal", "none"),
            columns(&["de", "dn"])
        );
        assert_eq!(
            deformation_columns("vertical", "vertical"),
            columns(&["du", "ev"])
        );
        assert!(deformation_columns("none", "none").is_empty());
    }

    #[test]
    fn weighted_sums_project_to_canonical_slots() -> Result<(), Error> {
        let mut list = DeformationList::new(&columns(&["de", "du", "ev"]), 2)?;
        list.add_point(&[1.0, 2.0, 3.0])?;
        list.add_point(&[2.0, 4.0, 5.0])?;

        let value = list.calc_deformation(&[0, 1], &[0.5, 0.5])?;
        // de and du are averaged; dn and eh are absent and come back zero;
        // ev was squared on finalisation
        assert_eq!(value[0], 1.5);
        assert_eq!(value[1], 0.0);
        assert_eq!(value[2], 3.0);
        assert_eq!(value[3], 0.0);
        assert_eq!(value[4], (9.0 + 25.0) / 2.0);
        Ok(())
    }

    #[test]
    fn nan_nodes_are_undefined() -> Result<(), Error> {
        let mut list = DeformationList::new(&columns(&["de", "dn"]), 2)?;
        list.add_point(&[1.0, f64::NAN])?;
        list.add_point(&[2.0, 3.0])?;

        // A zero weight still pulls the NaN in: 0 * NaN is NaN
        let result = list.calc_deformation(&[0, 1], &[0.0, 1.0]);
        assert!(matches!(result, Err(Error::Undefined(_))));
        Ok(())
    }

    #[test]
    fn size_checks() -> Result<(), Error> {
        let mut list = DeformationList::new(&columns(&["de"]), 2)?;
        assert!(list.check_valid().is_err());
        list.add_point(&[1.0])?;
        list.add_point(&[2.0])?;
        list.check_valid()?;
        assert!(list.add_point(&[3.0]).is_err());
        assert!(DeformationList::new(&columns(&["xx"]), 2).is_err());
        Ok(())
    }
}
