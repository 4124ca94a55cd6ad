//! End-to-end tests over complete on-disk deformation models.

use deformation::prelude::*;
use std::path::Path;

const COMPONENT_HEADER: &str = "version_added,version_revoked,reverse_patch,component,priority,\
    min_lon,max_lon,min_lat,max_lat,spatial_complete,min_date,max_date,time_complete,\
    npoints1,npoints2,displacement_type,error_type,max_displacement,spatial_model,\
    time_function,time0,factor0,time1,factor1,decay,file1,file2,description";

fn write(dir: &Path, name: &str, content: &str) {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

fn metadata(dir: &Path, version: &str) {
    write(
        dir,
        "metadata.csv",
        &format!(
            "item,value\n\
             model_name,Test deformation model\n\
             description,Synthetic model for the test suite\n\
             version,{version}\n\
             datum_code,TD2000\n\
             datum_name,Test Datum 2000\n\
             datum_epoch,2000-01-01\n\
             datum_epsg_srid,4167\n\
             ellipsoid_a,6378137\n\
             ellipsoid_rf,298.257222101\n\
             authority,Test authority\n\
             authority_website,http://example.com\n\
             authority_address,1 Example Street\n\
             authority_email,datum@example.com\n\
             source_url,http://example.com/model\n"
        ),
    );
}

fn t(text: &str) -> Time {
    Time::parse_required(text).unwrap()
}

/// Velocity factor of the test models at a date: years since 2000-01-01
fn vf(date: &str) -> f64 {
    t(date).days_after(t("2000-01-01")) / 365.2425
}

/// The smallest useful model: one velocity submodel over a 2x2 grid with a
/// uniform 0.01 m/year northwards velocity
fn simple_velocity_model() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    metadata(dir.path(), "20000101");
    write(
        dir.path(),
        "version.csv",
        "version,release_date,reverse_patch,reason\n\
         20000101,2000-01-01,N,First release\n",
    );
    write(
        dir.path(),
        "model.csv",
        "submodel,version_added,version_revoked,reverse_patch,description\n\
         ndm,20000101,0,N,National deformation model\n",
    );
    write(
        dir.path(),
        "ndm/component.csv",
        &format!(
            "{COMPONENT_HEADER}\n\
             20000101,0,N,0,0,170.0,172.0,-42.0,-40.0,N,0,0,Y,2,2,3d,none,1.0,llgrid,velocity,\
             2000-01-01,,,,,grid_vel.csv,,Secular velocity\n"
        ),
    );
    write(
        dir.path(),
        "ndm/grid_vel.csv",
        "lon,lat,de,dn,du\n\
         170.0,-42.0,0.0,0.01,0.0\n\
         172.0,-42.0,0.0,0.01,0.0\n\
         170.0,-40.0,0.0,0.01,0.0\n\
         172.0,-40.0,0.0,0.01,0.0\n",
    );
    dir
}

/// A two-version model: the national velocity model plus a step patch
/// added at version 20130801 (a reverse patch for an earthquake)
fn patched_model() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    metadata(dir.path(), "20130801");
    write(
        dir.path(),
        "version.csv",
        "version,release_date,reverse_patch,reason\n\
         20000101,2000-01-01,N,First release\n\
         20130801,2013-08-01,Y,Cook Strait earthquake patch\n",
    );
    write(
        dir.path(),
        "model.csv",
        "submodel,version_added,version_revoked,reverse_patch,description\n\
         ndm,20000101,0,N,National deformation model\n\
         patch_c1_20130801,20130801,0,Y,Cook Strait earthquake\n",
    );
    write(
        dir.path(),
        "ndm/component.csv",
        &format!(
            "{COMPONENT_HEADER}\n\
             20000101,0,N,0,0,170.0,172.0,-42.0,-40.0,N,0,0,Y,2,2,3d,none,1.0,llgrid,velocity,\
             2000-01-01,,,,,grid_vel.csv,,Secular velocity\n"
        ),
    );
    write(
        dir.path(),
        "ndm/grid_vel.csv",
        "lon,lat,de,dn,du\n\
         170.0,-42.0,0.0,0.01,0.0\n\
         172.0,-42.0,0.0,0.01,0.0\n\
         170.0,-40.0,0.0,0.01,0.0\n\
         172.0,-40.0,0.0,0.01,0.0\n",
    );
    write(
        dir.path(),
        "patch_c1_20130801/component.csv",
        &format!(
            "{COMPONENT_HEADER}\n\
             20130801,0,Y,0,0,170.0,172.0,-42.0,-40.0,Y,0,0,Y,2,2,horizontal,none,0.1,llgrid,step,\
             2013-08-01,-1.0,,0.0,,grid_step.csv,,Coseismic displacement\n"
        ),
    );
    write(
        dir.path(),
        "patch_c1_20130801/grid_step.csv",
        "lon,lat,de,dn\n\
         170.0,-42.0,0.1,0.0\n\
         172.0,-42.0,0.1,0.0\n\
         170.0,-40.0,0.1,0.0\n\
         172.0,-40.0,0.1,0.0\n",
    );
    dir
}

/// A nested grid: a coarse outer grid (de = 1) with a finer, higher
/// priority inset (de = 2), grouped as one component family
fn nested_model() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    metadata(dir.path(), "20000101");
    write(
        dir.path(),
        "version.csv",
        "version,release_date,reverse_patch,reason\n\
         20000101,2000-01-01,N,First release\n",
    );
    write(
        dir.path(),
        "model.csv",
        "submodel,version_added,version_revoked,reverse_patch,description\n\
         ndm,20000101,0,N,National deformation model\n",
    );
    write(
        dir.path(),
        "ndm/component.csv",
        &format!(
            "{COMPONENT_HEADER}\n\
             20000101,0,N,1,0,160.0,180.0,-50.0,-30.0,Y,0,0,Y,2,2,horizontal,none,2.0,llgrid,velocity,\
             2000-01-01,,,,,outer.csv,,Outer grid\n\
             20000101,0,N,1,1,170.0,172.0,-42.0,-40.0,Y,0,0,Y,2,2,horizontal,none,2.0,llgrid,velocity,\
             2000-01-01,,,,,inner.csv,,Inner grid\n"
        ),
    );
    write(
        dir.path(),
        "ndm/outer.csv",
        "lon,lat,de,dn\n\
         160.0,-50.0,1.0,0.0\n\
         180.0,-50.0,1.0,0.0\n\
         160.0,-30.0,1.0,0.0\n\
         180.0,-30.0,1.0,0.0\n",
    );
    write(
        dir.path(),
        "ndm/inner.csv",
        "lon,lat,de,dn\n\
         170.0,-42.0,2.0,0.0\n\
         172.0,-42.0,2.0,0.0\n\
         170.0,-40.0,2.0,0.0\n\
         172.0,-40.0,2.0,0.0\n",
    );
    dir
}

/// A model whose single component only covers 2000..2010 and is not
/// time-complete
fn bounded_time_model() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    metadata(dir.path(), "20000101");
    write(
        dir.path(),
        "version.csv",
        "version,release_date,reverse_patch,reason\n\
         20000101,2000-01-01,N,First release\n",
    );
    write(
        dir.path(),
        "model.csv",
        "submodel,version_added,version_revoked,reverse_patch,description\n\
         ndm,20000101,0,N,National deformation model\n",
    );
    write(
        dir.path(),
        "ndm/component.csv",
        &format!(
            "{COMPONENT_HEADER}\n\
             20000101,0,N,0,0,170.0,172.0,-42.0,-40.0,N,2000-01-01,2010-01-01,N,2,2,3d,none,1.0,\
             llgrid,velocity,2000-01-01,,,,,grid_vel.csv,,Secular velocity\n"
        ),
    );
    write(
        dir.path(),
        "ndm/grid_vel.csv",
        "lon,lat,de,dn,du\n\
         170.0,-42.0,0.0,0.01,0.0\n\
         172.0,-42.0,0.0,0.01,0.0\n\
         170.0,-40.0,0.0,0.01,0.0\n\
         172.0,-40.0,0.0,0.01,0.0\n",
    );
    dir
}

// ----- S C E N A R I O S ----------------------------------------------------------

#[test]
fn velocity_scenarios() -> Result<(), Error> {
    let dir = simple_velocity_model();
    let mut model = Model::open(dir.path())?;
    assert_eq!(model.version(), "20000101");
    assert_eq!(model.name(), "Test deformation model");

    // One year of a 0.01 m/year northwards velocity
    let f = vf("2001-01-01");
    let d = model.calc_deformation(171.0, -41.0, Some(t("2001-01-01")), None)?;
    assert!((d[0]).abs() < 1e-12);
    assert!((d[1] - 0.01 * f).abs() < 1e-12);
    assert!((d[1] - 0.01).abs() < 3e-5);
    assert!((d[2]).abs() < 1e-12);
    assert_eq!(d[3], 0.0);
    assert_eq!(d[4], 0.0);

    // A base date at the reference time changes nothing
    let d2 = model.calc_deformation(171.0, -41.0, Some(t("2001-01-01")), Some(t("2000-01-01")))?;
    for i in 0..5 {
        assert!((d[i] - d2[i]).abs() < 1e-12);
    }

    // At the reference time the deformation is exactly zero
    let d = model.calc_deformation(171.0, -41.0, Some(t("2000-01-01")), None)?;
    assert_eq!(d, [0.0; 5]);

    // Just west of the grid is out of range (the submodel is not
    // spatially complete)
    assert!(matches!(
        model.calc_deformation(169.9999, -41.0, Some(t("2001-01-01")), None),
        Err(Error::OutOfRange(_))
    ));

    // A longitude offset by a full turn wraps onto the grid
    let d = model.calc_deformation(171.0 - 360.0, -41.0, Some(t("2001-01-01")), None)?;
    assert!((d[1] - 0.01 * f).abs() < 1e-12);
    Ok(())
}

#[test]
fn apply_to_shifts_latitude() -> Result<(), Error> {
    let dir = simple_velocity_model();
    let mut model = Model::open(dir.path())?;

    let f = vf("2001-01-01");
    let (_, dndlt) = model.ellipsoid().metres_per_degree(171.0, -41.0);
    let coord = model.apply_to(171.0, -41.0, 0.0, Some(t("2001-01-01")), None, false)?;
    assert!((coord[0] - 171.0).abs() < 1e-12);
    assert!((coord[1] - (-41.0 + 0.01 * f / dndlt)).abs() < 1e-12);
    assert!((coord[2]).abs() < 1e-12);
    Ok(())
}

#[test]
fn apply_and_remove_round_trip() -> Result<(), Error> {
    let dir = simple_velocity_model();
    let mut model = Model::open(dir.path())?;

    let date = Some(t("2005-06-30"));
    let shifted = model.apply_to(171.25, -40.5, 10.0, date, None, false)?;
    let back = model.apply_to(shifted[0], shifted[1], shifted[2], date, None, true)?;
    assert!((back[0] - 171.25).abs() < 1e-9);
    assert!((back[1] - -40.5).abs() < 1e-9);
    assert!((back[2] - 10.0).abs() < 1e-4);
    Ok(())
}

#[test]
fn same_version_pair_has_no_active_components() -> Result<(), Error> {
    let dir = simple_velocity_model();
    let mut model = Model::open(dir.path())?;

    model.set_version(Some("20000101"), Some("20000101"))?;
    let d = model.calc_deformation(171.0, -41.0, Some(t("2001-01-01")), None)?;
    assert_eq!(d, [0.0; 5]);
    Ok(())
}

#[test]
fn same_date_pair_is_zero() -> Result<(), Error> {
    let dir = simple_velocity_model();
    let mut model = Model::open(dir.path())?;
    let d = model.calc_deformation(171.0, -41.0, Some(t("2004-03-01")), Some(t("2004-03-01")))?;
    for v in d {
        assert!(v.abs() < 1e-12);
    }
    Ok(())
}

#[test]
fn point_array_application() -> Result<(), Error> {
    let dir = simple_velocity_model();
    let mut model = Model::open(dir.path())?;

    let mut points = [[170.5, -41.5, 0.0], [171.5, -40.5, 5.0]];
    model.apply_to_points(&mut points, Some(t("2001-01-01")), None, false)?;
    let f = vf("2001-01-01");
    let (_, dndlt) = model.ellipsoid().metres_per_degree(170.5, -41.5);
    assert!((points[0][1] - (-41.5 + 0.01 * f / dndlt)).abs() < 1e-12);
    assert_eq!(points[1][2], 5.0);
    Ok(())
}

#[test]
fn date_closures() -> Result<(), Error> {
    let dir = simple_velocity_model();
    let mut model = Model::open(dir.path())?;

    let f = vf("2001-01-01");
    let (_, dndlt) = model.ellipsoid().metres_per_degree(171.0, -41.0);
    let expected_lat = -41.0 + 0.01 * f / dndlt;
    {
        let mut llh = model.calc_llh_func(171.0, -41.0, 0.0, false);
        let coord = llh(t("2001-01-01"))?;
        assert!((coord[1] - expected_lat).abs() < 1e-12);
    }

    let ellps = *model.ellipsoid();
    let xyz = ellps.xyz(171.0, -41.0, 0.0);
    let mut xyz_func = model.calc_xyz_func(xyz, false);
    let moved = xyz_func(t("2001-01-01"))?;
    let (lon, lat, _) = ellps.geodetic(moved);
    assert!((lon - 171.0).abs() < 1e-9);
    assert!((lat - expected_lat).abs() < 1e-9);
    Ok(())
}

// ----- V E R S I O N   A R I T H M E T I C ----------------------------------------

#[test]
fn version_selection_and_differences() -> Result<(), Error> {
    let dir = patched_model();
    let mut model = Model::open(dir.path())?;
    assert_eq!(model.version(), "20130801");
    assert_eq!(model.versions(), vec!["20000101", "20130801"]);

    // Before the earthquake the patch backdates the coordinates: its step
    // is -1 before the event and 0 after
    let d = model.calc_deformation(171.0, -41.0, Some(t("2010-01-01")), None)?;
    assert!((d[0] - -0.1).abs() < 1e-9);
    assert!((d[1] - 0.01 * vf("2010-01-01")).abs() < 1e-9);

    // After the event the patch contributes nothing
    let d = model.calc_deformation(171.0, -41.0, Some(t("2014-01-01")), None)?;
    assert!(d[0].abs() < 1e-9);

    // The difference between the versions isolates the patch
    model.set_version(Some("20130801"), Some("20000101"))?;
    assert_eq!(model.version_name(), "20130801-20000101");
    assert_eq!(model.base_version(), Some("20000101"));
    let d = model.calc_deformation(171.0, -41.0, Some(t("2010-01-01")), None)?;
    assert!((d[0] - -0.1).abs() < 1e-9);
    assert!(d[1].abs() < 1e-12);

    // The old version alone has no patch
    model.set_version(Some("20000101"), None)?;
    let d = model.calc_deformation(171.0, -41.0, Some(t("2010-01-01")), None)?;
    assert!(d[0].abs() < 1e-12);

    // Unknown versions are rejected
    assert!(model.set_version(Some("20990101"), None).is_err());
    Ok(())
}

#[test]
fn reverse_patch_enumeration() -> Result<(), Error> {
    let dir = patched_model();
    let mut model = Model::open(dir.path())?;

    let scaled = model.reverse_patch_components(None)?;
    assert_eq!(scaled.len(), 1);
    // Added at the version: base factor -1, times the step value -1 at the
    // datum epoch
    assert!((scaled[0].factor - 1.0).abs() < 1e-12);
    let component = model.component(scaled[0].component);
    assert_eq!(component.submodel(), "patch_c1_20130801");

    // No components change at the first version
    let scaled = model.reverse_patch_components(Some("20000101"))?;
    assert!(scaled.is_empty());
    Ok(())
}

#[test]
fn submodel_filters_select_and_exclude() -> Result<(), Error> {
    let dir = patched_model();

    let mut options = ModelOptions::new();
    options.submodels = Some("ndm");
    let mut model = Model::open_with(dir.path(), &options)?;
    let d = model.calc_deformation(171.0, -41.0, Some(t("2010-01-01")), None)?;
    assert!(d[0].abs() < 1e-12); // no patch loaded

    let mut options = ModelOptions::new();
    options.submodels = Some("-c1_20130801");
    let mut model = Model::open_with(dir.path(), &options)?;
    let d = model.calc_deformation(171.0, -41.0, Some(t("2010-01-01")), None)?;
    assert!(d[0].abs() < 1e-12);

    let mut options = ModelOptions::new();
    options.submodels = Some("c1_20130801");
    let mut model = Model::open_with(dir.path(), &options)?;
    let d = model.calc_deformation(171.0, -41.0, Some(t("2010-01-01")), None)?;
    assert!((d[0] - -0.1).abs() < 1e-9);
    assert!(d[1].abs() < 1e-12); // ndm excluded
    Ok(())
}

// ----- N E S T E D   G R I D S ----------------------------------------------------

#[test]
fn nested_grids_resolve_by_priority() -> Result<(), Error> {
    let dir = nested_model();
    let mut model = Model::open(dir.path())?;

    let f = vf("2001-01-01");
    // Inside the inset the fine grid wins
    let d = model.calc_deformation(171.0, -41.0, Some(t("2001-01-01")), None)?;
    assert!((d[0] - 2.0 * f).abs() < 1e-9);

    // Outside the inset the coarse grid applies
    let d = model.calc_deformation(165.0, -41.0, Some(t("2001-01-01")), None)?;
    assert!((d[0] - 1.0 * f).abs() < 1e-9);

    // Outside the whole family the (complete) component contributes zero
    let d = model.calc_deformation(150.0, -41.0, Some(t("2001-01-01")), None)?;
    assert_eq!(d[0], 0.0);
    Ok(())
}

// ----- T I M E   R A N G E S ------------------------------------------------------

#[test]
fn time_range_errors_latch_until_date_changes() -> Result<(), Error> {
    let dir = bounded_time_model();
    let mut model = Model::open(dir.path())?;

    assert!(matches!(
        model.calc_deformation(171.0, -41.0, Some(t("2015-01-01")), None),
        Err(Error::OutOfRange(_))
    ));
    // Latched: repeated evaluation at the same date re-raises
    assert!(matches!(
        model.calc_deformation(172.0, -40.0, Some(t("2015-01-01")), None),
        Err(Error::OutOfRange(_))
    ));
    // A date inside the range works again
    let d = model.calc_deformation(171.0, -41.0, Some(t("2005-01-01")), None)?;
    assert!((d[1] - 0.01 * vf("2005-01-01")).abs() < 1e-9);
    Ok(())
}

// ----- L O A D   V A L I D A T I O N ----------------------------------------------

#[test]
fn metadata_version_must_be_latest() {
    let dir = simple_velocity_model();
    // Add a newer version to version.csv without updating the metadata
    write(
        dir.path(),
        "version.csv",
        "version,release_date,reverse_patch,reason\n\
         20000101,2000-01-01,N,First release\n\
         20130801,2013-08-01,N,Newer release\n",
    );
    let Err(Error::Definition(msg)) = Model::open(dir.path()) else {
        panic!("expected a model definition error");
    };
    assert!(msg.contains("not most recent"), "{msg}");
}

#[test]
fn missing_metadata_item_is_fatal() {
    let dir = simple_velocity_model();
    write(
        dir.path(),
        "metadata.csv",
        "item,value\nmodel_name,Test\nversion,20000101\n",
    );
    assert!(matches!(
        Model::open(dir.path()),
        Err(Error::Definition(_))
    ));
}

#[test]
fn unknown_component_version_is_fatal() {
    let dir = simple_velocity_model();
    write(
        dir.path(),
        "ndm/component.csv",
        &format!(
            "{COMPONENT_HEADER}\n\
             20990101,0,N,0,0,170.0,172.0,-42.0,-40.0,N,0,0,Y,2,2,3d,none,1.0,llgrid,velocity,\
             2000-01-01,,,,,grid_vel.csv,,Secular velocity\n"
        ),
    );
    let Err(Error::Definition(msg)) = Model::open(dir.path()) else {
        panic!("expected a model definition error");
    };
    assert!(msg.contains("version.csv"), "{msg}");
}

#[test]
fn displacement_and_error_cannot_both_be_none() {
    let dir = simple_velocity_model();
    write(
        dir.path(),
        "ndm/component.csv",
        &format!(
            "{COMPONENT_HEADER}\n\
             20000101,0,N,0,0,170.0,172.0,-42.0,-40.0,N,0,0,Y,2,2,none,none,1.0,llgrid,velocity,\
             2000-01-01,,,,,grid_vel.csv,,Secular velocity\n"
        ),
    );
    assert!(matches!(
        Model::open(dir.path()),
        Err(Error::Definition(_))
    ));
}

#[test]
fn shared_grid_files_must_agree() {
    let dir = simple_velocity_model();
    // Two rows on the same grid file with different descriptions
    write(
        dir.path(),
        "ndm/component.csv",
        &format!(
            "{COMPONENT_HEADER}\n\
             20000101,0,N,0,0,170.0,172.0,-42.0,-40.0,N,0,0,Y,2,2,3d,none,1.0,llgrid,velocity,\
             2000-01-01,,,,,grid_vel.csv,,Secular velocity\n\
             20000101,0,N,0,0,170.0,172.0,-42.0,-40.0,N,0,0,Y,2,2,3d,none,1.0,llgrid,step,\
             2000-01-01,0.0,,1.0,,grid_vel.csv,,A different description\n"
        ),
    );
    let Err(Error::Definition(msg)) = Model::open(dir.path()) else {
        panic!("expected a model definition error");
    };
    assert!(msg.contains("Inconsistent usage"), "{msg}");
}

#[test]
fn load_all_validates_node_files() {
    let dir = simple_velocity_model();
    // Break the grid: drop a node row
    write(
        dir.path(),
        "ndm/grid_vel.csv",
        "lon,lat,de,dn,du\n\
         170.0,-42.0,0.0,0.01,0.0\n\
         172.0,-42.0,0.0,0.01,0.0\n\
         170.0,-40.0,0.0,0.01,0.0\n",
    );
    // Lazy open succeeds; the damage only shows when the grid loads
    let mut model = Model::open(dir.path()).unwrap();
    assert!(model.load_all().is_err());

    let mut options = ModelOptions::new();
    options.load_all = true;
    assert!(matches!(
        Model::open_with(dir.path(), &options),
        Err(Error::Definition(_))
    ));
}

// ----- C A C H I N G --------------------------------------------------------------

#[test]
fn cache_survives_reopen() -> Result<(), Error> {
    let dir = simple_velocity_model();

    let f = vf("2001-01-01");
    let expected = {
        let mut model = Model::open(dir.path())?;
        let d = model.calc_deformation(171.0, -41.0, Some(t("2001-01-01")), None)?;
        model.close();
        d
    };
    assert!(dir.path().join("cache.h5").exists());

    // Second open reads the prebuilt grid from the cache
    let mut model = Model::open(dir.path())?;
    let d = model.calc_deformation(171.0, -41.0, Some(t("2001-01-01")), None)?;
    assert_eq!(d, expected);
    assert!((d[1] - 0.01 * f).abs() < 1e-12);

    // Clearing the cache starts from scratch and still agrees
    let mut options = ModelOptions::new();
    options.clear_cache = true;
    let mut model = Model::open_with(dir.path(), &options)?;
    let d = model.calc_deformation(171.0, -41.0, Some(t("2001-01-01")), None)?;
    assert_eq!(d, expected);
    Ok(())
}

#[test]
fn cache_can_be_ignored() -> Result<(), Error> {
    let dir = simple_velocity_model();
    let mut options = ModelOptions::new();
    options.use_cache = false;
    let mut model = Model::open_with(dir.path(), &options)?;
    model.calc_deformation(171.0, -41.0, Some(t("2001-01-01")), None)?;
    model.close();
    assert!(!dir.path().join("cache.h5").exists());
    Ok(())
}

// ----- C A T A L O G --------------------------------------------------------------

#[test]
fn catalog_access() -> Result<(), Error> {
    let dir = patched_model();
    let model = Model::open(dir.path())?;

    assert_eq!(model.datum_code(), "TD2000");
    assert_eq!(model.datum_name(), "Test Datum 2000");
    assert_eq!(model.datum_epsg_srid(), 4167);
    assert_eq!(model.datum_epoch(), t("2000-01-01"));
    assert_eq!(model.metadata("authority"), Some("Test authority"));
    assert_eq!(model.current_version(), "20130801");

    let info = model.version_info("20130801").unwrap();
    assert!(info.reverse_patch);
    assert_eq!(info.release_date, t("2013-08-01"));

    let description = model.description(true, true);
    assert!(description.contains("Test deformation model"));
    assert!(description.contains("Versions available"));
    assert!(description.contains("patch_c1_20130801"));
    assert!(description.contains("velocity model"));

    // The national model sorts ahead of the patch
    let components = model.components(true);
    let first = model.component(components[0]);
    assert_eq!(first.submodel(), "ndm");
    assert_eq!(first.component_id(), 0);
    assert_eq!(first.priority(), 0);
    assert_eq!(first.version_added(), "20000101");
    assert_eq!(first.version_revoked(), "0");
    assert!(first.name().contains("grid_vel.csv"));
    assert!(first.applies_for_version("20130801"));
    Ok(())
}
