//! Spatial submodels, nested-grid sets, and the file/cache store.
//!
//! A spatial submodel wraps a grid or TIN together with the bounding box
//! and column metadata from the component definition. Several component
//! rows (typically one per model version) may reference the same node file;
//! they then share one [SpatialModel] instance, so the expensive load and
//! the per-point interpolation happen once. Rows grouped by a positive
//! `component` id form a [SpatialModelSet]: a nested-grid family resolved
//! in descending priority order.
//!
//! Both the model and the set memoise the last evaluated point, including
//! any error it produced, so sibling components querying the same location
//! are O(1) after the first.

use crate::cache::{Cache, CachedArray};
use crate::deformation::deformation_columns;
use crate::grid::Grid;
use crate::model::ComponentRecord;
use crate::tin::Tin;
use crate::Error;
use log::trace;
use std::path::PathBuf;

// ----- T H E   S T O R E ----------------------------------------------------------

/// The model base directory paired with the binary cache. Everything that
/// reads node files or caches prebuilt arrays goes through here.
pub struct ModelStore {
    basedir: PathBuf,
    cache: Cache,
    #[cfg(test)]
    _keep: Option<tempfile::TempDir>,
}

impl ModelStore {
    pub fn new(basedir: PathBuf, cache: Cache) -> ModelStore {
        ModelStore {
            basedir,
            cache,
            #[cfg(test)]
            _keep: None,
        }
    }

    /// A store over a temporary directory, which lives as long as the store
    #[cfg(test)]
    pub(crate) fn for_tests(dir: tempfile::TempDir, cache: Cache) -> ModelStore {
        ModelStore {
            basedir: dir.path().to_path_buf(),
            cache,
            _keep: Some(dir),
        }
    }

    /// Absolute path of a model-relative logical file ('/'-separated)
    pub fn file_name(&self, file: &str) -> PathBuf {
        let mut path = self.basedir.clone();
        for part in file.split('/') {
            path.push(part);
        }
        path
    }

    /// The cache fingerprint: file names and modification times of every
    /// source file, then the caller's metadata values, colon-joined. An
    /// unreadable modification time disables caching for the entry.
    fn fingerprint(&self, metadata: &[String], files: &[&str]) -> Option<String> {
        let mut parts = Vec::with_capacity(files.len() * 2 + metadata.len());
        for file in files {
            let mtime = std::fs::metadata(self.file_name(file))
                .and_then(|m| m.modified())
                .ok()?;
            let mtime: chrono::DateTime<chrono::Local> = mtime.into();
            parts.push(file.to_string());
            parts.push(mtime.format("%Y%m%d%H%M%S").to_string());
        }
        parts.extend(metadata.iter().cloned());
        Some(parts.join(":"))
    }

    /// Look up a prebuilt array for a logical file
    pub fn cached(
        &mut self,
        file: &str,
        metadata: &[String],
        files: &[&str],
    ) -> Option<CachedArray> {
        let fingerprint = self.fingerprint(metadata, files)?;
        self.cache.get(file, &fingerprint)
    }

    /// Store a prebuilt array for a logical file
    pub fn store(
        &mut self,
        file: &str,
        metadata: &[String],
        files: &[&str],
        rows: usize,
        cols: usize,
        values: &[f64],
    ) {
        if let Some(fingerprint) = self.fingerprint(metadata, files) {
            self.cache.set(file, &fingerprint, rows, cols, values);
        }
    }

    /// Release the cache handle
    pub fn close(&mut self) {
        self.cache.close();
    }
}

// ----- S P A T I A L   M O D E L S ------------------------------------------------

#[derive(Debug)]
enum SpatialKind {
    Grid(Grid),
    Tin(Tin),
}

/// One grid or TIN with its definition metadata and the per-point memo
#[derive(Debug)]
pub struct SpatialModel {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
    spatial_complete: bool,
    npoints1: i64,
    npoints2: i64,
    displacement_type: String,
    error_type: String,
    description: String,
    name: String,
    display: String,
    kind: SpatialKind,
    // Cached calculations
    xy: Option<(f64, f64)>,
    xydisp: [f64; 5],
    xy_in_range: bool,
    xy_range_error: Option<String>,
    undefined_error: Option<String>,
    model_error: Option<String>,
}

impl SpatialModel {
    /// Rows sharing this key are served by the same instance
    pub fn key_for(submodel: &str, comp: &ComponentRecord) -> String {
        format!("{submodel}:{}:{}", comp.spatial_model, comp.file1)
    }

    pub fn new(
        store: &ModelStore,
        submodel: &str,
        comp: &ComponentRecord,
    ) -> Result<SpatialModel, Error> {
        let columns = deformation_columns(&comp.displacement_type, &comp.error_type);
        let file1 = format!("{submodel}/{}", comp.file1);
        let name = file1.clone();

        let (kind, display) = match comp.spatial_model.as_str() {
            "llgrid" => {
                let grid = Grid::new(
                    store,
                    &file1,
                    comp.min_lon,
                    comp.max_lon,
                    comp.min_lat,
                    comp.max_lat,
                    comp.npoints1,
                    comp.npoints2,
                    &columns,
                    &name,
                )?;
                let (dlon, dlat) = grid.resolution();
                let display = format!("Grid model ({dlon} x {dlat}) using {name}");
                (SpatialKind::Grid(grid), display)
            }
            "lltin" => {
                let file2 = comp.file2.as_deref().ok_or_else(|| {
                    Error::Definition(format!(
                        "Triangulation file missing from deformation model definition for {name}"
                    ))
                })?;
                let file2 = format!("{submodel}/{file2}");
                let tin = Tin::new(
                    store,
                    &file1,
                    &file2,
                    comp.min_lon,
                    comp.max_lon,
                    comp.min_lat,
                    comp.max_lat,
                    comp.npoints1,
                    comp.npoints2,
                    &columns,
                    &name,
                )?;
                let display = format!("TIN model using {name}");
                (SpatialKind::Tin(tin), display)
            }
            other => {
                return Err(Error::Definition(format!(
                    "Invalid spatial model type {other}"
                )))
            }
        };

        Ok(SpatialModel {
            min_lon: comp.min_lon,
            max_lon: comp.max_lon,
            min_lat: comp.min_lat,
            max_lat: comp.max_lat,
            spatial_complete: comp.spatial_complete,
            npoints1: comp.npoints1,
            npoints2: comp.npoints2,
            displacement_type: comp.displacement_type.clone(),
            error_type: comp.error_type.clone(),
            description: comp.description.clone(),
            name,
            display,
            kind,
            xy: None,
            xydisp: [0.0; 5],
            xy_in_range: true,
            xy_range_error: None,
            undefined_error: None,
            model_error: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A one-line description for catalog listings
    pub fn display(&self) -> &str {
        &self.display
    }

    /// A second row referencing the same node file must agree on every
    /// definition attribute
    pub fn compatible_definition(&self, comp: &ComponentRecord) -> bool {
        self.min_lon == comp.min_lon
            && self.min_lat == comp.min_lat
            && self.max_lon == comp.max_lon
            && self.max_lat == comp.max_lat
            && self.spatial_complete == comp.spatial_complete
            && self.npoints1 == comp.npoints1
            && self.npoints2 == comp.npoints2
            && self.displacement_type == comp.displacement_type
            && self.error_type == comp.error_type
            && self.description == comp.description
    }

    /// Force-load the node data for validation
    pub fn load(&mut self, store: &mut ModelStore) -> Result<(), Error> {
        let result = match &mut self.kind {
            SpatialKind::Grid(grid) => grid.load(store),
            SpatialKind::Tin(tin) => tin.load(store),
        };
        if let Err(Error::Definition(msg)) = &result {
            self.model_error = Some(msg.clone());
        }
        result
    }

    /// The deformation at a point, and whether the point was in range.
    /// Out-of-range on a spatially complete submodel is absorbed into a
    /// zero contribution; everything else is memoised and re-raised.
    pub fn calc_deformation(
        &mut self,
        x: f64,
        y: f64,
        store: &mut ModelStore,
    ) -> Result<([f64; 5], bool), Error> {
        trace!("Calculating spatial component {} at ({x},{y})", self.name);
        if let Some(msg) = &self.model_error {
            return Err(Error::Definition(msg.clone()));
        }

        if self.xy != Some((x, y)) {
            self.xy = Some((x, y));
            self.xy_range_error = None;
            self.undefined_error = None;
            let result = match &mut self.kind {
                SpatialKind::Grid(grid) => grid.calc_deformation(x, y, store),
                SpatialKind::Tin(tin) => tin.calc_deformation(x, y, store),
            };
            match result {
                Ok(disp) => {
                    self.xydisp = disp;
                    self.xy_in_range = true;
                }
                Err(Error::OutOfRange(msg)) => {
                    if self.spatial_complete {
                        self.xydisp = [0.0; 5];
                        self.xy_in_range = false;
                    } else {
                        self.xy_range_error = Some(msg.clone());
                        return Err(Error::OutOfRange(msg));
                    }
                }
                Err(Error::Undefined(msg)) => {
                    self.undefined_error = Some(msg.clone());
                    return Err(Error::Undefined(msg));
                }
                Err(e) => {
                    if let Error::Definition(msg) = &e {
                        self.model_error = Some(msg.clone());
                    }
                    return Err(e);
                }
            }
            trace!(
                "Spatial component {} calculated as {:?}",
                self.name,
                self.xydisp
            );
        } else if let Some(msg) = &self.xy_range_error {
            return Err(Error::OutOfRange(msg.clone()));
        } else if let Some(msg) = &self.undefined_error {
            return Err(Error::Undefined(msg.clone()));
        } else {
            trace!("Using cached spatial component {:?}", self.xydisp);
        }

        Ok((self.xydisp, self.xy_in_range))
    }
}

// ----- N E S T E D   S E T S ------------------------------------------------------

/// A prioritised family of spatial models (a nested grid). Presents the
/// same evaluation interface as a single [SpatialModel].
#[derive(Debug)]
pub struct SpatialModelSet {
    component: i64,
    // Pool indices in definition order, and the same sorted by descending
    // priority (ties keep definition order)
    members: Vec<usize>,
    priorities: Vec<i64>,
    order: Vec<usize>,
    check_key: String,
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
    // Cached calculations
    xy: Option<(f64, f64)>,
    xydisp: [f64; 5],
    xy_in_range: bool,
    xy_range_error: Option<String>,
    undefined_error: Option<String>,
    model_error: Option<String>,
}

impl SpatialModelSet {
    /// Members of one set must agree on version range, displacement/error
    /// types, and the full time function signature
    pub fn compatibility_key(comp: &ComponentRecord) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            comp.version_added,
            comp.version_revoked,
            comp.displacement_type,
            comp.error_type,
            comp.time_function_key()
        )
    }

    pub fn new(
        pool_index: usize,
        model: &SpatialModel,
        comp: &ComponentRecord,
    ) -> SpatialModelSet {
        SpatialModelSet {
            component: comp.component,
            members: vec![pool_index],
            priorities: vec![comp.priority],
            order: vec![pool_index],
            check_key: Self::compatibility_key(comp),
            min_lon: model.min_lon,
            max_lon: model.max_lon,
            min_lat: model.min_lat,
            max_lat: model.max_lat,
            xy: None,
            xydisp: [0.0; 5],
            xy_in_range: true,
            xy_range_error: None,
            undefined_error: None,
            model_error: None,
        }
    }

    pub fn add_member(
        &mut self,
        pool_index: usize,
        model: &SpatialModel,
        comp: &ComponentRecord,
    ) -> Result<(), Error> {
        if Self::compatibility_key(comp) != self.check_key {
            return Err(Error::Definition(format!(
                "Subcomponent {} of {} uses inconsistent versions, time models or displacement/error submodels",
                self.component, model.name
            )));
        }

        self.min_lon = self.min_lon.min(model.min_lon);
        self.min_lat = self.min_lat.min(model.min_lat);
        self.max_lon = self.max_lon.max(model.max_lon);
        self.max_lat = self.max_lat.max(model.max_lat);
        self.members.push(pool_index);
        self.priorities.push(comp.priority);

        let mut indices: Vec<usize> = (0..self.members.len()).collect();
        indices.sort_by(|&a, &b| self.priorities[b].cmp(&self.priorities[a]));
        self.order = indices.into_iter().map(|i| self.members[i]).collect();
        Ok(())
    }

    /// The lowest-priority member underlies the whole set
    fn base_index(&self) -> usize {
        self.order[self.order.len() - 1]
    }

    pub fn name(&self, pool: &[SpatialModel]) -> String {
        format!("{} and subcomponents", pool[self.base_index()].name)
    }

    pub fn display(&self, pool: &[SpatialModel]) -> String {
        if self.order.len() == 1 {
            return pool[self.base_index()].display.clone();
        }
        let mut description = "Nested models:".to_string();
        for &m in self.order.iter().rev() {
            description.push('\n');
            description.push_str(&pool[m].display);
        }
        description
    }

    /// Query members in descending priority: the first whose evaluation is
    /// in range wins. A spatially complete member outside its own bounds
    /// contributes zero and passes the point down; a range error from an
    /// incomplete member propagates immediately.
    pub fn calc_deformation(
        &mut self,
        x: f64,
        y: f64,
        pool: &mut [SpatialModel],
        store: &mut ModelStore,
    ) -> Result<([f64; 5], bool), Error> {
        if let Some(msg) = &self.model_error {
            return Err(Error::Definition(msg.clone()));
        }

        if self.xy != Some((x, y)) {
            self.xy = Some((x, y));
            self.xy_range_error = None;
            self.undefined_error = None;
            for &m in &self.order {
                match pool[m].calc_deformation(x, y, store) {
                    Ok((disp, in_range)) => {
                        self.xydisp = disp;
                        self.xy_in_range = in_range;
                        if in_range {
                            break;
                        }
                    }
                    Err(Error::OutOfRange(msg)) => {
                        trace!("Spatial component {} out of range", pool[m].name);
                        self.xy_range_error = Some(msg.clone());
                        return Err(Error::OutOfRange(msg));
                    }
                    Err(Error::Undefined(msg)) => {
                        trace!("Spatial component {} undefined", pool[m].name);
                        self.undefined_error = Some(msg.clone());
                        return Err(Error::Undefined(msg));
                    }
                    Err(e) => {
                        if let Error::Definition(msg) = &e {
                            self.model_error = Some(msg.clone());
                        }
                        return Err(e);
                    }
                }
            }
        } else if let Some(msg) = &self.xy_range_error {
            return Err(Error::OutOfRange(msg.clone()));
        } else if let Some(msg) = &self.undefined_error {
            return Err(Error::Undefined(msg.clone()));
        }

        Ok((self.xydisp, self.xy_in_range))
    }
}

// ----- T E S T S ------------------------------------------------------------------
