//! Regular longitude/latitude grid submodels.
//!
//! A grid is an `nlon x nlat` lattice of deformation nodes in row-major
//! order of increasing latitude then longitude. The node file is only read
//! on first use (or force-loaded for validation); loads go through the
//! binary cache when possible. Interpolation is bilinear over the four
//! surrounding nodes, with longitudes wrapped eastwards by full turns so a
//! model straddling the antimeridian accepts both signs.

use crate::deformation::DeformationList;
use crate::spatial::ModelStore;
use crate::table::{TableReader, TableSpec};
use crate::Error;
use log::trace;

/// A regular lon/lat grid with lazily loaded node data
#[derive(Clone, Debug)]
pub struct Grid {
    file: String,
    name: String,
    columns: Vec<String>,
    min_lon: f64,
    max_lon: f64,
    min_lat: f64,
    max_lat: f64,
    nlon: usize,
    nlat: usize,
    dlon: f64,
    dlat: f64,
    loaded: bool,
    valid: bool,
    data: DeformationList,
}

impl Grid {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: &ModelStore,
        file: &str,
        min_lon: f64,
        max_lon: f64,
        min_lat: f64,
        max_lat: f64,
        nlon: i64,
        nlat: i64,
        columns: &[String],
        name: &str,
    ) -> Result<Grid, Error> {
        if !store.file_name(file).exists() {
            return Err(Error::Definition(format!("Invalid grid filename {file}")));
        }
        if nlon < 2 || nlat < 2 {
            return Err(Error::Definition(format!(
                "Invalid number of grid rows or columns in deformation model definition for {name}"
            )));
        }
        let (nlon, nlat) = (nlon as usize, nlat as usize);

        let dlon = (max_lon - min_lon) / (nlon - 1) as f64;
        if dlon < 0.0 {
            return Err(Error::Definition(format!(
                "Invalid longitude range {min_lon} - {max_lon} in deformation model definition for {name}"
            )));
        }
        let dlat = (max_lat - min_lat) / (nlat - 1) as f64;
        if dlat < 0.0 {
            return Err(Error::Definition(format!(
                "Invalid latitude range {min_lat} - {max_lat} in deformation model definition for {name}"
            )));
        }

        let data = DeformationList::new(columns, nlon * nlat)?;

        Ok(Grid {
            file: file.to_string(),
            name: name.to_string(),
            columns: columns.to_vec(),
            min_lon,
            max_lon,
            min_lat,
            max_lat,
            nlon,
            nlat,
            dlon,
            dlat,
            loaded: false,
            valid: false,
            data,
        })
    }

    /// Returns min lon, min lat, max lon, max lat, nlon, nlat
    pub fn spec(&self) -> (f64, f64, f64, f64, usize, usize) {
        (
            self.min_lon,
            self.min_lat,
            self.max_lon,
            self.max_lat,
            self.nlon,
            self.nlat,
        )
    }

    /// Returns the longitude and latitude increments
    pub fn resolution(&self) -> (f64, f64) {
        (self.dlon, self.dlat)
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    /// Force the node data into memory. Grids load on demand by default;
    /// an explicit load validates the file without evaluating anything.
    pub fn load(&mut self, store: &mut ModelStore) -> Result<(), Error> {
        if self.loaded {
            return self.check_usable();
        }
        self.loaded = true;
        self.load_nodes(store)?;
        self.valid = true;
        Ok(())
    }

    fn check_usable(&self) -> Result<(), Error> {
        if !self.valid {
            return Err(Error::Definition(
                "Cannot use invalid grid component - see previous errors".to_string(),
            ));
        }
        Ok(())
    }

    fn cache_metadata(&self) -> Vec<String> {
        let mut metadata = vec![self.nlon.to_string(), self.nlat.to_string()];
        metadata.extend(self.columns.iter().cloned());
        metadata
    }

    fn load_nodes(&mut self, store: &mut ModelStore) -> Result<(), Error> {
        let metadata = self.cache_metadata();
        if let Some(cached) = store.cached(&self.file, &metadata, &[&self.file]) {
            trace!("Grid {} loaded from binary cache", self.name);
            self.data.set_data(cached.values, cached.rows, cached.cols)?;
            return Ok(());
        }

        let mut specs: Vec<String> = vec!["lon float".to_string(), "lat float".to_string()];
        specs.extend(self.columns.iter().map(|c| format!("data[]={c} ?float")));
        let specs: Vec<&str> = specs.iter().map(String::as_str).collect();
        let spec = TableSpec::new("grid", &specs)?;
        let reader = TableReader::open(&spec, &store.file_name(&self.file))?;

        let lontol = self.dlon / 10000.0;
        let lattol = self.dlat / 10000.0;
        let mut nc: i64 = -1;
        let mut nr: usize = 0;
        let mut xc = self.min_lon - self.dlon;
        let mut yc = self.min_lat;
        for record in reader {
            let record = record?;
            nc += 1;
            xc += self.dlon;
            if nc >= self.nlon as i64 {
                nc = 0;
                xc = self.min_lon;
                nr += 1;
                yc += self.dlat;
                if nr > self.nlat {
                    return Err(Error::Definition(format!(
                        "Too many grid points in {}",
                        self.name
                    )));
                }
            }
            let lon = record.float("lon")?;
            let lat = record.float("lat")?;
            if (lon - xc).abs() > lontol || (lat - yc).abs() > lattol {
                return Err(Error::Definition(format!(
                    "Grid latitude/longitude out of sequence: ({lon},{lat}) should be ({xc},{yc}) in {}",
                    self.name
                )));
            }
            self.data.add_point(&record.group_floats("data")?)?;
        }
        self.data.check_valid()?;

        let data = self.data.data()?;
        store.store(
            &self.file,
            &metadata,
            &[&self.file],
            self.nlon * self.nlat,
            self.columns.len(),
            data,
        );
        Ok(())
    }

    /// Bilinear interpolation at a point, as the canonical 5-tuple
    pub fn calc_deformation(
        &mut self,
        x: f64,
        y: f64,
        store: &mut ModelStore,
    ) -> Result<[f64; 5], Error> {
        if !self.loaded {
            self.load(store)?;
        }
        self.check_usable()?;

        let x0 = x;
        let mut x = x;
        while x < self.min_lon {
            x += 360.0;
        }
        if x > self.max_lon || y < self.min_lat || y > self.max_lat {
            return Err(Error::OutOfRange(format!(
                "{x0},{y} is out of range of grid in {}",
                self.name
            )));
        }

        let mut wx = (x - self.min_lon) / self.dlon;
        let mut wy = (y - self.min_lat) / self.dlat;
        let mut nx = wx as usize;
        let mut ny = wy as usize;
        if nx >= self.nlon - 1 {
            nx = self.nlon - 2;
        }
        if ny >= self.nlat - 1 {
            ny = self.nlat - 2;
        }
        wx -= nx as f64;
        wy -= ny as f64;
        let ny = ny * self.nlon;

        let rows = [nx + ny, nx + ny + 1, nx + ny + self.nlon, nx + ny + self.nlon + 1];
        let factors = [
            (1.0 - wx) * (1.0 - wy),
            wx * (1.0 - wy),
            (1.0 - wx) * wy,
            wx * wy,
        ];
        self.data.calc_deformation(&rows, &factors)
    }
}

// ----- T E S T S ------------------------------------------------------------------
