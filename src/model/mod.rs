//! The deformation model: loading, validation, version arithmetic, and
//! evaluation.
//!
//! A model is a directory with three catalog tables - `model.csv` naming the
//! submodels, `version.csv` the releases, `metadata.csv` the datum and
//! authority items - plus one `component.csv` per submodel wiring spatial
//! submodels to time functions across version ranges.
//!
//! [Model::open] reads and validates everything except the node data, which
//! loads on first use. [Model::set_version] selects the components active
//! for a version (or the delta between two versions), assigning each a
//! factor of -1, 0 or +1; [Model::calc_deformation] then accumulates the
//! active components at a point and date into the 5-tuple
//! `(de, dn, du, eh, ev)` of displacements in metres and standard errors.

use crate::cache::Cache;
use crate::ellipsoid::Ellipsoid;
use crate::spatial::{ModelStore, SpatialModel, SpatialModelSet};
use crate::table::{Record, TableReader, TableSpec};
use crate::temporal::{TimeFunction, TimeModel};
use crate::time::Time;
use crate::Error;
use log::{debug, info, trace};
use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::path::Path;

// ----- T A B L E   S C H E M A S --------------------------------------------------

static VERSION_SPEC: Lazy<TableSpec> = Lazy::new(|| {
    TableSpec::new(
        "version",
        &[
            r"version \d{8}",
            "release_date datetime",
            "reverse_patch boolean",
            "reason unicode",
        ],
    )
    .expect("static version schema")
});

static MODEL_SPEC: Lazy<TableSpec> = Lazy::new(|| {
    TableSpec::new(
        "model",
        &[
            r"submodel \w+",
            r"version_added \d{8}",
            r"version_revoked (\d{8}|0)",
            "reverse_patch boolean",
            "description unicode",
        ],
    )
    .expect("static model schema")
});

static METADATA_SPEC: Lazy<TableSpec> = Lazy::new(|| {
    TableSpec::new("metadata", &[r"item \w+", "value unicode"]).expect("static metadata schema")
});

static COMPONENT_SPEC: Lazy<TableSpec> = Lazy::new(|| {
    TableSpec::new(
        "submodel",
        &[
            r"version_added \d{8}",
            r"version_revoked (\d{8}|0)",
            "reverse_patch boolean",
            "component int",
            "priority int",
            "min_lon float",
            "max_lon float",
            "min_lat float",
            "max_lat float",
            "spatial_complete boolean",
            "min_date datetime",
            "max_date datetime",
            "time_complete boolean",
            "npoints1 int",
            "npoints2 int",
            "displacement_type (horizontal|vertical|3d|none)",
            "error_type (horizontal|vertical|3d|none)",
            "max_displacement float",
            "spatial_model (llgrid|lltin)",
            "time_function (velocity|step|ramp|decay)",
            "time0 ?datetime",
            "factor0 ?float",
            "time1 ?datetime",
            "factor1 ?float",
            "decay ?float",
            r"file1 \w+\.csv",
            r"file2 ?\w+\.csv",
            "description unicode",
        ],
    )
    .expect("static component schema")
});

/// Metadata items every model must define
const METADATA_ITEMS: [&str; 14] = [
    "model_name",
    "description",
    "version",
    "datum_code",
    "datum_name",
    "datum_epoch",
    "datum_epsg_srid",
    "ellipsoid_a",
    "ellipsoid_rf",
    "authority",
    "authority_website",
    "authority_address",
    "authority_email",
    "source_url",
];

// ----- T Y P E D   R E C O R D S --------------------------------------------------

/// One row of `version.csv`
#[derive(Clone, Debug)]
pub struct VersionRecord {
    pub version: String,
    pub release_date: Time,
    pub reverse_patch: bool,
    pub reason: String,
}

impl VersionRecord {
    fn from_record(r: &Record) -> Result<VersionRecord, Error> {
        Ok(VersionRecord {
            version: r.str("version")?.to_string(),
            release_date: r.time("release_date")?,
            reverse_patch: r.boolean("reverse_patch")?,
            reason: r.str("reason")?.to_string(),
        })
    }
}

/// One row of `model.csv`
#[derive(Clone, Debug)]
pub struct SubmodelRecord {
    pub submodel: String,
    pub version_added: String,
    pub version_revoked: String,
    pub reverse_patch: bool,
    pub description: String,
}

impl SubmodelRecord {
    fn from_record(r: &Record) -> Result<SubmodelRecord, Error> {
        Ok(SubmodelRecord {
            submodel: r.str("submodel")?.to_string(),
            version_added: r.str("version_added")?.to_string(),
            version_revoked: r.str("version_revoked")?.to_string(),
            reverse_patch: r.boolean("reverse_patch")?,
            description: r.str("description")?.to_string(),
        })
    }
}

/// One row of a submodel `component.csv`
#[derive(Clone, Debug)]
pub struct ComponentRecord {
    pub version_added: String,
    pub version_revoked: String,
    pub reverse_patch: bool,
    pub component: i64,
    pub priority: i64,
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
    pub spatial_complete: bool,
    pub min_date: Option<Time>,
    pub max_date: Option<Time>,
    pub time_complete: bool,
    pub npoints1: i64,
    pub npoints2: i64,
    pub displacement_type: String,
    pub error_type: String,
    pub max_displacement: f64,
    pub spatial_model: String,
    pub time_function: String,
    pub time0: Option<Time>,
    pub factor0: Option<f64>,
    pub time1: Option<Time>,
    pub factor1: Option<f64>,
    pub decay: Option<f64>,
    pub file1: String,
    pub file2: Option<String>,
    pub description: String,
}

fn opt_text<T: std::fmt::Display>(v: &Option<T>) -> String {
    match v {
        Some(v) => v.to_string(),
        None => "None".to_string(),
    }
}

impl ComponentRecord {
    fn from_record(r: &Record) -> Result<ComponentRecord, Error> {
        Ok(ComponentRecord {
            version_added: r.str("version_added")?.to_string(),
            version_revoked: r.str("version_revoked")?.to_string(),
            reverse_patch: r.boolean("reverse_patch")?,
            component: r.int("component")?,
            priority: r.int("priority")?,
            min_lon: r.float("min_lon")?,
            max_lon: r.float("max_lon")?,
            min_lat: r.float("min_lat")?,
            max_lat: r.float("max_lat")?,
            spatial_complete: r.boolean("spatial_complete")?,
            min_date: r.opt_time("min_date")?,
            max_date: r.opt_time("max_date")?,
            time_complete: r.boolean("time_complete")?,
            npoints1: r.int("npoints1")?,
            npoints2: r.int("npoints2")?,
            displacement_type: r.str("displacement_type")?.to_string(),
            error_type: r.str("error_type")?.to_string(),
            max_displacement: r.float("max_displacement")?,
            spatial_model: r.str("spatial_model")?.to_string(),
            time_function: r.str("time_function")?.to_string(),
            time0: r.opt_time("time0")?,
            factor0: r.opt_float("factor0")?,
            time1: r.opt_time("time1")?,
            factor1: r.opt_float("factor1")?,
            decay: r.opt_float("decay")?,
            file1: r.str("file1")?.to_string(),
            file2: r.opt_str("file2")?.map(str::to_string),
            description: r.str("description")?.to_string(),
        })
    }

    /// The time function deduplication key: the full temporal signature
    pub fn time_function_key(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}",
            self.time_function,
            opt_text(&self.factor0),
            opt_text(&self.time0),
            opt_text(&self.factor1),
            opt_text(&self.time1),
            opt_text(&self.decay),
        )
    }
}

#[cfg(test)]
impl ComponentRecord {
    /// A minimal valid record for unit tests to specialise
    pub(crate) fn test_default() -> ComponentRecord {
        ComponentRecord {
            version_added: "20000101".to_string(),
            version_revoked: "0".to_string(),
            reverse_patch: false,
            component: 0,
            priority: 0,
            min_lon: 0.0,
            max_lon: 0.0,
            min_lat: 0.0,
            max_lat: 0.0,
            spatial_complete: true,
            min_date: None,
            max_date: None,
            time_complete: true,
            npoints1: 2,
            npoints2: 2,
            displacement_type: "horizontal".to_string(),
            error_type: "none".to_string(),
            max_displacement: 0.0,
            spatial_model: "llgrid".to_string(),
            time_function: "velocity".to_string(),
            time0: None,
            factor0: None,
            time1: None,
            factor1: None,
            decay: None,
            file1: "grid.csv".to_string(),
            file2: None,
            description: "test".to_string(),
        }
    }
}

// ----- C O M P O N E N T S --------------------------------------------------------

#[derive(Debug)]
enum SpatialRef {
    Single(usize),
    Set(SpatialModelSet),
}

/// One deformation component: a spatial submodel (or nested set) bound to a
/// time function over a range of model versions
#[derive(Debug)]
pub struct Component {
    submodel: String,
    submodel_description: String,
    description: String,
    version_added: String,
    version_revoked: String,
    component: i64,
    priority: i64,
    name: String,
    spatial: SpatialRef,
    time_function: usize,
    factor: f64,
    time_factor: f64,
    time_error_factor: f64,
}

impl Component {
    pub fn submodel(&self) -> &str {
        &self.submodel
    }

    pub fn submodel_description(&self) -> &str {
        &self.submodel_description
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn version_added(&self) -> &str {
        &self.version_added
    }

    pub fn version_revoked(&self) -> &str {
        &self.version_revoked
    }

    pub fn component_id(&self) -> i64 {
        self.component
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the component contributes to a model version
    pub fn applies_for_version(&self, version: &str) -> bool {
        self.version_added.as_str() <= version
            && (self.version_revoked == "0" || self.version_revoked.as_str() > version)
    }

    fn set_factor(&mut self, factor: f64) {
        self.factor = factor;
    }

    fn set_date(
        &mut self,
        time_function: &mut TimeFunction,
        date: Time,
        base_date: Option<Time>,
    ) -> Result<(), Error> {
        trace!(
            "Setting submodel {} date {date} (base date {})",
            self.name,
            opt_text(&base_date)
        );
        let (factor, error_factor) = time_function.calc_factor(date, base_date)?;
        self.time_factor = factor * self.factor;
        self.time_error_factor = error_factor * self.factor;
        trace!("Time factor calculated as {}", self.time_factor);
        Ok(())
    }

    fn calc_deformation(
        &mut self,
        x: f64,
        y: f64,
        pool: &mut [SpatialModel],
        store: &mut ModelStore,
    ) -> Result<[f64; 5], Error> {
        trace!("Calculating submodel {} for location ({x},{y})", self.name);

        // If the time factor is 0 then the spatial part is irrelevant
        let t0 = self.time_factor;
        if t0 == 0.0 {
            trace!("Time factor = 0.0 - spatial not calculated");
            return Ok([0.0; 5]);
        }
        let t1 = self.time_error_factor;

        let (v, _) = match &mut self.spatial {
            SpatialRef::Single(i) => pool[*i].calc_deformation(x, y, store)?,
            SpatialRef::Set(set) => set.calc_deformation(x, y, pool, store)?,
        };
        Ok([v[0] * t0, v[1] * t0, v[2] * t0, v[3] * t1, v[4] * t1])
    }

    fn spatial_display(&self, pool: &[SpatialModel]) -> String {
        match &self.spatial {
            SpatialRef::Single(i) => pool[*i].display().to_string(),
            SpatialRef::Set(set) => set.display(pool),
        }
    }
}

/// A component index scaled by its reverse-patch factor
#[derive(Clone, Copy, Debug)]
pub struct ScaledComponent {
    pub factor: f64,
    pub component: usize,
}

// ----- T H E   M O D E L ----------------------------------------------------------

/// Options for [Model::open_with]. The defaults match [Model::open]: the
/// latest version, all submodels, lazy loading, and the binary cache in use.
#[derive(Clone, Copy, Debug, Default)]
pub struct ModelOptions<'a> {
    /// Version to select, defaulting to the latest
    pub version: Option<&'a str>,
    /// Base version for difference calculations
    pub base_version: Option<&'a str>,
    /// Submodel filter: `name+name+...` selects, `-name+name+...` excludes;
    /// a name also matches any submodel called `patch_<name>...`
    pub submodels: Option<&'a str>,
    /// Load every spatial submodel up front (validates all node files)
    pub load_all: bool,
    /// Use the binary cache file
    pub use_cache: bool,
    /// Delete the binary cache file before opening it
    pub clear_cache: bool,
}

impl<'a> ModelOptions<'a> {
    pub fn new() -> ModelOptions<'a> {
        ModelOptions {
            use_cache: true,
            ..Default::default()
        }
    }
}

struct SubmodelFilter {
    include: bool,
    names: Vec<String>,
}

impl SubmodelFilter {
    fn parse(filter: &str) -> SubmodelFilter {
        let (include, filter) = match filter.strip_prefix('-') {
            Some(rest) => (false, rest),
            None => (true, filter),
        };
        SubmodelFilter {
            include,
            names: filter.to_lowercase().split('+').map(str::to_string).collect(),
        }
    }

    fn selects(&self, submodel: &str) -> bool {
        let submodel = submodel.to_lowercase();
        let matched = self
            .names
            .iter()
            .any(|n| submodel == *n || submodel.starts_with(&format!("patch_{n}")));
        matched == self.include
    }
}

/// A deformation model with multiple versions and multiple submodels,
/// loaded from its base directory
pub struct Model {
    store: ModelStore,
    metadata: BTreeMap<String, String>,
    versions: BTreeMap<String, VersionRecord>,
    current_version: String,
    name: String,
    datum_code: String,
    datum_name: String,
    datum_epoch: Time,
    datum_srid: i64,
    ellipsoid: Ellipsoid,
    spatial: Vec<SpatialModel>,
    time_functions: Vec<TimeFunction>,
    components: Vec<Component>,
    active: Vec<usize>,
    version: String,
    base_version: Option<String>,
    version_name: String,
    date: Option<Time>,
    base_date: Option<Time>,
    time_range_error: Option<String>,
}

impl Model {
    /// Open a model with default options: latest version, all submodels,
    /// lazy loading, binary cache in use
    pub fn open(basedir: impl AsRef<Path>) -> Result<Model, Error> {
        Model::open_with(basedir, &ModelOptions::new())
    }

    /// Open a model, reading and validating all catalog tables. Spatial
    /// node data is not read unless `load_all` is set.
    pub fn open_with(basedir: impl AsRef<Path>, options: &ModelOptions) -> Result<Model, Error> {
        let basedir = basedir.as_ref();
        info!("Loading deformation model from {}", basedir.display());
        if !basedir.is_dir() {
            return Err(Error::Definition(format!(
                "Invalid deformation model base directory {}",
                basedir.display()
            )));
        }
        let model_file = basedir.join("model.csv");
        let version_file = basedir.join("version.csv");
        let metadata_file = basedir.join("metadata.csv");
        for f in [&model_file, &version_file, &metadata_file] {
            if !f.is_file() {
                return Err(Error::Definition(format!(
                    "File {} is missing from deformation model",
                    f.display()
                )));
            }
        }

        // The release catalog; the latest version is the lexical maximum
        let mut versions: BTreeMap<String, VersionRecord> = BTreeMap::new();
        for record in TableReader::open(&VERSION_SPEC, &version_file)? {
            let ver = VersionRecord::from_record(&record?)?;
            if versions.contains_key(&ver.version) {
                return Err(Error::Definition(format!(
                    "Version {} repeated in {}",
                    ver.version,
                    version_file.display()
                )));
            }
            versions.insert(ver.version.clone(), ver);
        }

        let mut metadata = BTreeMap::new();
        for record in TableReader::open(&METADATA_SPEC, &metadata_file)? {
            let record = record?;
            metadata.insert(
                record.str("item")?.to_string(),
                record.str("value")?.to_string(),
            );
        }
        for item in METADATA_ITEMS {
            if !metadata.contains_key(item) {
                return Err(Error::Definition(format!(
                    "Metadata item {item} missing in {}",
                    metadata_file.display()
                )));
            }
        }

        let declared_version = metadata["version"].clone();
        if !versions.contains_key(&declared_version) {
            return Err(Error::Definition(format!(
                "Version {declared_version} from metadata is not defined in version.csv"
            )));
        }
        let current_version = versions
            .keys()
            .next_back()
            .cloned()
            .unwrap_or_default();
        if declared_version != current_version {
            return Err(Error::Definition(format!(
                "Version {declared_version} from metadata is not most recent version in version.csv"
            )));
        }

        let name = metadata["model_name"].clone();
        let datum_code = metadata["datum_code"].clone();
        let datum_name = metadata["datum_name"].clone();
        let datum_srid: i64 = metadata["datum_epsg_srid"].parse().map_err(|_| {
            Error::Definition("Invalid datum EPSG srid - must be an integer".to_string())
        })?;
        let datum_epoch = Time::parse_required(&metadata["datum_epoch"]).map_err(|e| {
            Error::Definition(format!(
                "Invalid datum epoch in {}: {e}",
                metadata_file.display()
            ))
        })?;
        let ellipsoid = {
            let a: f64 = metadata["ellipsoid_a"].parse().map_err(|_| {
                Error::Definition("Invalid ellipsoid_a - must be a number".to_string())
            })?;
            let rf: f64 = metadata["ellipsoid_rf"].parse().map_err(|_| {
                Error::Definition("Invalid ellipsoid_rf - must be a number".to_string())
            })?;
            Ellipsoid::from_a_rf(a, rf)
        };

        let cache_file = basedir.join("cache.h5");
        if options.clear_cache && cache_file.exists() {
            std::fs::remove_file(&cache_file)?;
        }
        let cache = if options.use_cache {
            Cache::open(&cache_file)
        } else {
            Cache::null()
        };
        let mut store = ModelStore::new(basedir.to_path_buf(), cache);

        let filter = options.submodels.map(SubmodelFilter::parse);

        // Wire up the components, pooling spatial submodels and time
        // functions by their deduplication keys
        let mut spatial: Vec<SpatialModel> = Vec::new();
        let mut spatial_keys: BTreeMap<String, usize> = BTreeMap::new();
        let mut time_functions: Vec<TimeFunction> = Vec::new();
        let mut time_keys: BTreeMap<String, usize> = BTreeMap::new();
        let mut components: Vec<Component> = Vec::new();

        for record in TableReader::open(&MODEL_SPEC, &model_file)? {
            let mdl = SubmodelRecord::from_record(&record?)?;
            if let Some(filter) = &filter {
                if !filter.selects(&mdl.submodel) {
                    debug!("Skipping submodel {} (filtered)", mdl.submodel);
                    continue;
                }
            }

            for (what, version) in [
                ("version_added", &mdl.version_added),
                ("version_revoked", &mdl.version_revoked),
            ] {
                if version != "0" && !versions.contains_key(version) {
                    return Err(Error::Definition(format!(
                        "Submodel {} {what} {version} is not in version.csv",
                        mdl.submodel
                    )));
                }
            }
            if !basedir.join(&mdl.submodel).is_dir() {
                return Err(Error::Definition(format!(
                    "Submodel {} directory is missing",
                    mdl.submodel
                )));
            }
            let component_file = basedir.join(&mdl.submodel).join("component.csv");
            if !component_file.is_file() {
                return Err(Error::Definition(format!(
                    "Submodel {} component.csv file is missing",
                    mdl.submodel
                )));
            }
            let component_name = format!("{}/component.csv", mdl.submodel);

            // Component groups (nested-grid families) within this submodel
            let mut groups: BTreeMap<i64, usize> = BTreeMap::new();

            for record in TableReader::open(&COMPONENT_SPEC, &component_file)? {
                let comp = ComponentRecord::from_record(&record?)?;
                for (what, version) in [
                    ("version_added", &comp.version_added),
                    ("version_revoked", &comp.version_revoked),
                ] {
                    if version != "0" && !versions.contains_key(version) {
                        return Err(Error::Definition(format!(
                            "Submodel {what} {version} in {component_name} is not in version.csv"
                        )));
                    }
                }
                if comp.displacement_type == "none" && comp.error_type == "none" {
                    return Err(Error::Definition(format!(
                        "Component in {component_name} has displacement_type and error_type as none"
                    )));
                }

                let spatial_key = SpatialModel::key_for(&mdl.submodel, &comp);
                let spatial_index = match spatial_keys.get(&spatial_key) {
                    Some(&i) => {
                        if !spatial[i].compatible_definition(&comp) {
                            return Err(Error::Definition(format!(
                                "Inconsistent usage of grid file {} in {} component.csv",
                                comp.file1, mdl.submodel
                            )));
                        }
                        i
                    }
                    None => {
                        let mut model = SpatialModel::new(&store, &mdl.submodel, &comp)?;
                        if options.load_all {
                            model.load(&mut store)?;
                        }
                        spatial.push(model);
                        spatial_keys.insert(spatial_key, spatial.len() - 1);
                        spatial.len() - 1
                    }
                };

                let time_key = comp.time_function_key();
                let time_index = match time_keys.get(&time_key) {
                    Some(&i) => i,
                    None => {
                        let model = TimeModel::new(
                            &comp.time_function,
                            comp.factor0,
                            comp.time0,
                            comp.factor1,
                            comp.time1,
                            comp.decay,
                        )?;
                        time_functions.push(TimeFunction::new(
                            model,
                            comp.min_date,
                            comp.max_date,
                            comp.time_complete,
                        ));
                        time_keys.insert(time_key, time_functions.len() - 1);
                        time_functions.len() - 1
                    }
                };

                if comp.component > 0 {
                    if let Some(&ci) = groups.get(&comp.component) {
                        let Component {
                            spatial: SpatialRef::Set(set),
                            ..
                        } = &mut components[ci]
                        else {
                            return Err(Error::Definition(format!(
                                "Subcomponent grouping error in {component_name}"
                            )));
                        };
                        set.add_member(spatial_index, &spatial[spatial_index], &comp)?;
                        let name = set.name(&spatial);
                        components[ci].name = name;
                        continue;
                    }
                    let set =
                        SpatialModelSet::new(spatial_index, &spatial[spatial_index], &comp);
                    groups.insert(comp.component, components.len());
                    components.push(Component {
                        submodel: mdl.submodel.clone(),
                        submodel_description: mdl.description.clone(),
                        description: comp.description.clone(),
                        version_added: comp.version_added.clone(),
                        version_revoked: comp.version_revoked.clone(),
                        component: comp.component,
                        priority: comp.priority,
                        name: set.name(&spatial),
                        spatial: SpatialRef::Set(set),
                        time_function: time_index,
                        factor: 1.0,
                        time_factor: 0.0,
                        time_error_factor: 0.0,
                    });
                    continue;
                }

                components.push(Component {
                    submodel: mdl.submodel.clone(),
                    submodel_description: mdl.description.clone(),
                    description: comp.description.clone(),
                    version_added: comp.version_added.clone(),
                    version_revoked: comp.version_revoked.clone(),
                    component: comp.component,
                    priority: comp.priority,
                    name: spatial[spatial_index].name().to_string(),
                    spatial: SpatialRef::Single(spatial_index),
                    time_function: time_index,
                    factor: 1.0,
                    time_factor: 0.0,
                    time_error_factor: 0.0,
                });
            }
        }

        let mut model = Model {
            store,
            metadata,
            versions,
            current_version,
            name,
            datum_code,
            datum_name,
            datum_epoch,
            datum_srid,
            ellipsoid,
            spatial,
            time_functions,
            components,
            active: Vec::new(),
            version: String::new(),
            base_version: None,
            version_name: String::new(),
            date: None,
            base_date: None,
            time_range_error: None,
        };
        model.set_version(options.version, options.base_version)?;
        Ok(model)
    }

    /// Reset the version used for calculations. With a base version, the
    /// result is the difference between the two versions: each component's
    /// factor becomes `applies(version) - applies(baseVersion)`, and only
    /// components with a non-zero factor stay active.
    pub fn set_version(
        &mut self,
        version: Option<&str>,
        base_version: Option<&str>,
    ) -> Result<(), Error> {
        let version = match version {
            None => self.current_version.clone(),
            Some(v) => {
                if !self.versions.contains_key(v) {
                    return Err(Error::InvalidValue(format!(
                        "Requested version {v} of deformation model is not defined"
                    )));
                }
                v.to_string()
            }
        };
        if let Some(bv) = base_version {
            if !self.versions.contains_key(bv) {
                return Err(Error::InvalidValue(format!(
                    "Requested base version {bv} of deformation model is not defined"
                )));
            }
        }

        self.active.clear();
        for (i, c) in self.components.iter_mut().enumerate() {
            let mut factor = 0.0;
            if c.applies_for_version(&version) {
                factor = 1.0;
            }
            if let Some(bv) = base_version {
                if c.applies_for_version(bv) {
                    factor -= 1.0;
                }
            }
            if factor != 0.0 {
                c.set_factor(factor);
                self.active.push(i);
            }
        }

        self.version_name = match base_version {
            Some(bv) => format!("{version}-{bv}"),
            None => version.clone(),
        };
        self.version = version;
        self.base_version = base_version.map(str::to_string);
        self.date = None;
        self.base_date = None;
        self.time_range_error = None;
        Ok(())
    }

    /// Set the calculation date, and optionally a base date to calculate
    /// the difference in deformation between the two. An out-of-range date
    /// is latched and re-raised by every evaluation until the date changes.
    pub fn set_date(&mut self, date: Option<Time>, base_date: Option<Time>) {
        let date = date.unwrap_or_else(Time::now);
        if Some(date) == self.date && base_date == self.base_date {
            return;
        }
        self.date = Some(date);
        self.base_date = base_date;
        self.time_range_error = None;
        for &i in &self.active {
            let c = &mut self.components[i];
            let tf = &mut self.time_functions[c.time_function];
            if let Err(Error::OutOfRange(msg)) = c.set_date(tf, date, base_date) {
                self.time_range_error = Some(msg);
                break;
            }
        }
    }

    /// The deformation 5-tuple `(de, dn, du, eh, ev)` at a location. The
    /// date and base date can be set in the same call; otherwise the values
    /// from [Model::set_date] are used. Errors are standard deviations
    /// (the accumulated variances pass through a final square root).
    pub fn calc_deformation(
        &mut self,
        x: f64,
        y: f64,
        date: Option<Time>,
        base_date: Option<Time>,
    ) -> Result<[f64; 5], Error> {
        if self.date.is_none() || date.is_some() || base_date.is_some() {
            self.set_date(date, base_date);
        }
        if let Some(msg) = &self.time_range_error {
            return Err(Error::OutOfRange(msg.clone()));
        }

        let mut result = [0.0; 5];
        for &i in &self.active {
            let value =
                self.components[i].calc_deformation(x, y, &mut self.spatial, &mut self.store)?;
            for (r, v) in result.iter_mut().zip(value.iter()) {
                *r += v;
            }
        }
        result[3] = result[3].abs().sqrt();
        result[4] = result[4].abs().sqrt();
        Ok(result)
    }

    /// Apply (or with `subtract` remove) the deformation at a date to
    /// geodetic coordinates, returning `[lon, lat, hgt]`
    pub fn apply_to(
        &mut self,
        lon: f64,
        lat: f64,
        hgt: f64,
        date: Option<Time>,
        base_date: Option<Time>,
        subtract: bool,
    ) -> Result<[f64; 3], Error> {
        let factor = if subtract { -1.0 } else { 1.0 };
        let deun = self.calc_deformation(lon, lat, date, base_date)?;
        let (dedln, dndlt) = self.ellipsoid.metres_per_degree(lon, lat);
        Ok([
            lon + factor * deun[0] / dedln,
            lat + factor * deun[1] / dndlt,
            hgt + factor * deun[2],
        ])
    }

    /// Apply the deformation to an array of `[lon, lat, hgt]` points in
    /// place
    pub fn apply_to_points(
        &mut self,
        points: &mut [[f64; 3]],
        date: Option<Time>,
        base_date: Option<Time>,
        subtract: bool,
    ) -> Result<(), Error> {
        for point in points {
            *point = self.apply_to(point[0], point[1], point[2], date, base_date, subtract)?;
        }
        Ok(())
    }

    /// A closure over a fixed location, returning the deformed
    /// `[lon, lat, hgt]` as a function of date
    pub fn calc_llh_func(
        &mut self,
        lon: f64,
        lat: f64,
        hgt: f64,
        subtract: bool,
    ) -> impl FnMut(Time) -> Result<[f64; 3], Error> + '_ {
        let (dedln, dndlt) = self.ellipsoid.metres_per_degree(lon, lat);
        let factor = if subtract { -1.0 } else { 1.0 };
        move |date| {
            let deun = self.calc_deformation(lon, lat, Some(date), None)?;
            Ok([
                lon + factor * deun[0] / dedln,
                lat + factor * deun[1] / dndlt,
                hgt + factor * deun[2],
            ])
        }
    }

    /// A closure over a fixed location given in earth-centred cartesian
    /// coordinates, returning the deformed XYZ as a function of date
    pub fn calc_xyz_func(
        &mut self,
        xyz: [f64; 3],
        subtract: bool,
    ) -> impl FnMut(Time) -> Result<[f64; 3], Error> + '_ {
        let ellipsoid = self.ellipsoid;
        let (lon, lat, hgt) = ellipsoid.geodetic(xyz);
        let mut llh = self.calc_llh_func(lon, lat, hgt, subtract);
        move |date| {
            let [lon, lat, hgt] = llh(date)?;
            Ok(ellipsoid.xyz(lon, lat, hgt))
        }
    }

    /// Force-load every spatial submodel, validating all node files
    pub fn load_all(&mut self) -> Result<(), Error> {
        for model in &mut self.spatial {
            model.load(&mut self.store)?;
        }
        Ok(())
    }

    /// Component indices sorted for presentation: the national model first,
    /// then by version added and submodel name. Restricted to the current
    /// version unless `all_versions` is set.
    pub fn components(&self, all_versions: bool) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.components.len())
            .filter(|&i| all_versions || self.components[i].applies_for_version(&self.version))
            .collect();
        indices.sort_by(|&a, &b| {
            let ka = &self.components[a];
            let kb = &self.components[b];
            (ka.submodel != "ndm", &ka.version_added, &ka.submodel).cmp(&(
                kb.submodel != "ndm",
                &kb.version_added,
                &kb.submodel,
            ))
        });
        indices
    }

    pub fn component(&self, index: usize) -> &Component {
        &self.components[index]
    }

    /// The signed components contributing to the reverse patch for a
    /// version: `-1` for components added at the version, `+1` for
    /// components revoked at it, scaled by the time factor at the datum
    /// epoch. Zero-factor entries are dropped.
    pub fn reverse_patch_components(
        &mut self,
        version: Option<&str>,
    ) -> Result<Vec<ScaledComponent>, Error> {
        let version = match version {
            Some(v) => v.to_string(),
            None => self.version.clone(),
        };
        if !self.versions.contains_key(&version) {
            return Err(Error::InvalidValue(format!(
                "Invalid version {version} requested"
            )));
        }

        let epoch = self.datum_epoch;
        let mut scaled = Vec::new();
        for i in self.components(true) {
            let c = &self.components[i];
            let factor = if c.version_added == version {
                -1.0
            } else if c.version_revoked == version {
                1.0
            } else {
                continue;
            };
            let tf_index = c.time_function;
            let (tf, _) = self.time_functions[tf_index].calc_factor(epoch, None)?;
            let factor = factor * tf;
            if factor != 0.0 {
                scaled.push(ScaledComponent {
                    factor,
                    component: i,
                });
            }
        }
        Ok(scaled)
    }

    // ----- Catalog access ---------------------------------------------------------

    /// A metadata item, if defined
    pub fn metadata(&self, item: &str) -> Option<&str> {
        self.metadata.get(item).map(String::as_str)
    }

    /// The name of this model
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The version currently selected for calculations
    pub fn version(&self) -> &str {
        &self.version
    }

    /// The base version if calculating a difference
    pub fn base_version(&self) -> Option<&str> {
        self.base_version.as_deref()
    }

    /// The name of the selected version (or version pair)
    pub fn version_name(&self) -> &str {
        &self.version_name
    }

    /// The latest version of the model
    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    /// All versions, in ascending order
    pub fn versions(&self) -> Vec<&str> {
        self.versions.keys().map(String::as_str).collect()
    }

    /// The version.csv information for a version
    pub fn version_info(&self, version: &str) -> Option<&VersionRecord> {
        self.versions.get(version)
    }

    pub fn datum_name(&self) -> &str {
        &self.datum_name
    }

    pub fn datum_code(&self) -> &str {
        &self.datum_code
    }

    pub fn datum_epoch(&self) -> Time {
        self.datum_epoch
    }

    pub fn datum_epsg_srid(&self) -> i64 {
        self.datum_srid
    }

    pub fn ellipsoid(&self) -> &Ellipsoid {
        &self.ellipsoid
    }

    /// A human-readable description of the model, optionally listing all
    /// versions and the submodel catalog
    pub fn description(&self, all_versions: bool, submodels: bool) -> String {
        let mut out = String::new();
        out.push_str(&format!("Deformation model: {}\n", self.name));
        out.push_str(&format!(
            "Datum: {} (reference epoch {})\n",
            self.datum_name, self.datum_epoch
        ));
        out.push_str(&format!("Version: {}\n\n", self.version));
        if let Some(description) = self.metadata("description") {
            out.push_str(description);
            out.push('\n');
        }

        if all_versions {
            out.push_str("\nVersions available:\n");
            for v in self.versions.values() {
                out.push_str(&format!(
                    "    {} released {}: {}\n",
                    v.version,
                    v.release_date.format_as("%d-%b-%Y"),
                    v.reason
                ));
            }
        }

        if submodels {
            let indices = self.components(all_versions);
            let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
            for &i in &indices {
                *counts.entry(self.components[i].submodel()).or_insert(0) += 1;
            }

            out.push_str("\nSubmodels:\n");
            let mut last_submodel = None;
            for &i in &indices {
                let c = &self.components[i];
                if last_submodel != Some(c.submodel()) {
                    out.push_str(&format!(
                        "\n    Submodel: {}: {}\n",
                        c.submodel(),
                        c.submodel_description().trim()
                    ));
                    last_submodel = Some(c.submodel());
                }
                let mut prefix = "    ";
                if counts[c.submodel()] > 1 {
                    out.push_str(&format!("        Component: {}\n", c.description().trim()));
                    prefix = "        ";
                }
                if all_versions {
                    out.push_str(&format!("{prefix}    Version added: {}", c.version_added()));
                    if c.version_revoked() != "0" {
                        out.push_str(&format!(" revoked: {}", c.version_revoked()));
                    }
                    out.push('\n');
                }
                out.push_str(&format!(
                    "{prefix}    Time function: {}\n",
                    self.time_functions[c.time_function].model()
                ));
                out.push_str(&format!(
                    "{prefix}    Spatial model: {}\n",
                    c.spatial_display(&self.spatial)
                ));
            }
        }
        out
    }

    /// Release the binary cache and drop the component lists
    pub fn close(&mut self) {
        self.active.clear();
        self.components.clear();
        self.spatial.clear();
        self.time_functions.clear();
        self.store.close();
    }
}

impl std::fmt::Display for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description(true, true))
    }
}

// ----- T E S T S ------------------------------------------------------------------
