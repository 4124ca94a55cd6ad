//! Triangulated irregular network submodels.
//!
//! A TIN carries deformation values on scattered nodes joined into a
//! triangulation. Nodes are 1-based with a zero sentinel at index 0, so the
//! triangle files can reference them directly. On load the triangulation is
//! validated - counter-clockwise triangles, consistent directed-edge
//! adjacency, a single convex boundary loop - and the interpolation
//! machinery is precomputed: triangle centroids and edge-normal vectors
//! scaled by inverse signed area, from which barycentric weights are a
//! cross product away.
//!
//! Point location walks the triangulation: start at the triangle with the
//! nearest centroid, then repeatedly step across the edge with the most
//! negative barycentric weight until all three are non-negative.

use crate::deformation::DeformationList;
use crate::spatial::ModelStore;
use crate::table::{TableReader, TableSpec};
use crate::Error;
use log::trace;

fn cross(a: [f64; 2], b: [f64; 2]) -> f64 {
    a[0] * b[1] - a[1] * b[0]
}

fn sub(a: [f64; 2], b: [f64; 2]) -> [f64; 2] {
    [a[0] - b[0], a[1] - b[1]]
}

/// A triangulated network with lazily loaded nodes and triangles
#[derive(Clone, Debug)]
pub struct Tin {
    pts_file: String,
    trg_file: String,
    name: String,
    columns: Vec<String>,
    min_lon: f64,
    max_lon: f64,
    min_lat: f64,
    max_lat: f64,
    npt: usize,
    ntrg: usize,
    loaded: bool,
    valid: bool,
    data: DeformationList,
    points: Vec<[f64; 2]>,
    triangles: Vec<[usize; 3]>,
    centroids: Vec<[f64; 2]>,
    edgevec: Vec<[[f64; 2]; 3]>,
    adjacent: Vec<[i64; 3]>,
}

impl Tin {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: &ModelStore,
        pts_file: &str,
        trg_file: &str,
        min_lon: f64,
        max_lon: f64,
        min_lat: f64,
        max_lat: f64,
        npt: i64,
        ntrg: i64,
        columns: &[String],
        name: &str,
    ) -> Result<Tin, Error> {
        if !store.file_name(pts_file).exists() {
            return Err(Error::Definition(format!(
                "Invalid trig point filename {pts_file}"
            )));
        }
        if !store.file_name(trg_file).exists() {
            return Err(Error::Definition(format!(
                "Invalid trig triangulation filename {trg_file}"
            )));
        }
        if npt < 2 || ntrg < 1 {
            return Err(Error::Definition(format!(
                "Invalid number of triangulation points or triangles in deformation model definition for {name}"
            )));
        }
        if min_lon >= max_lon {
            return Err(Error::Definition(format!(
                "Invalid longitude range {min_lon} - {max_lon} in deformation model definition for {name}"
            )));
        }
        if min_lat >= max_lat {
            return Err(Error::Definition(format!(
                "Invalid latitude range {min_lat} - {max_lat} in deformation model definition for {name}"
            )));
        }
        let (npt, ntrg) = (npt as usize, ntrg as usize);

        // Row 0 is the sentinel for the 1-based node ids
        let data = DeformationList::new(columns, npt + 1)?;

        Ok(Tin {
            pts_file: pts_file.to_string(),
            trg_file: trg_file.to_string(),
            name: name.to_string(),
            columns: columns.to_vec(),
            min_lon,
            max_lon,
            min_lat,
            max_lat,
            npt,
            ntrg,
            loaded: false,
            valid: false,
            data,
            points: Vec::new(),
            triangles: Vec::new(),
            centroids: Vec::new(),
            edgevec: Vec::new(),
            adjacent: Vec::new(),
        })
    }

    /// Force the network into memory. TINs load on demand by default.
    pub fn load(&mut self, store: &mut ModelStore) -> Result<(), Error> {
        if self.loaded {
            return self.check_usable();
        }
        self.loaded = true;
        self.load_points(store)?;
        self.load_triangles(store)?;
        self.setup_triangulation(store)?;
        self.valid = true;
        Ok(())
    }

    fn check_usable(&self) -> Result<(), Error> {
        if !self.valid {
            return Err(Error::Definition(
                "Cannot use invalid TIN component - see previous errors".to_string(),
            ));
        }
        Ok(())
    }

    fn load_points(&mut self, store: &mut ModelStore) -> Result<(), Error> {
        let metadata = vec![self.npt.to_string()];
        let coords_path = format!("{}.pts", self.pts_file);
        let cached_data = store.cached(&self.pts_file, &metadata, &[&self.pts_file]);
        let cached_coords = store.cached(&coords_path, &metadata, &[&self.pts_file]);
        if let (Some(data), Some(coords)) = (cached_data, cached_coords) {
            trace!("TIN {} points loaded from binary cache", self.name);
            self.data.set_data(data.values, data.rows, data.cols)?;
            self.points = coords
                .values
                .chunks_exact(2)
                .map(|c| [c[0], c[1]])
                .collect();
            return Ok(());
        }

        let mut specs: Vec<String> = vec![
            "id int".to_string(),
            "lon float".to_string(),
            "lat float".to_string(),
        ];
        specs.extend(self.columns.iter().map(|c| format!("data[]={c} float")));
        let specs: Vec<&str> = specs.iter().map(String::as_str).collect();
        let spec = TableSpec::new("trig_pts", &specs)?;
        let reader = TableReader::open(&spec, &store.file_name(&self.pts_file))?;

        self.points = vec![[0.0, 0.0]; self.npt + 1];
        self.data.add_point(&vec![0.0; self.columns.len()])?;
        let mut npt = 0usize;
        for record in reader {
            let record = record?;
            npt += 1;
            if npt > self.npt {
                return Err(Error::Definition(format!(
                    "Too many points in triangulation model for {}",
                    self.name
                )));
            }
            let id = record.int("id")?;
            if id != npt as i64 {
                return Err(Error::Definition(format!(
                    "TIN point id out of sequence: {id} for {}",
                    self.name
                )));
            }
            let lon = record.float("lon")?;
            let lat = record.float("lat")?;
            if lon < self.min_lon || lon > self.max_lon || lat < self.min_lat || lat > self.max_lat
            {
                return Err(Error::Definition(format!(
                    "TIN latitude/longitude out of range: ({lon},{lat}) for {}",
                    self.name
                )));
            }
            self.data.add_point(&record.group_floats("data")?)?;
            self.points[npt] = [lon, lat];
        }
        self.data.check_valid()?;

        store.store(
            &self.pts_file,
            &metadata,
            &[&self.pts_file],
            self.npt + 1,
            self.columns.len(),
            self.data.data()?,
        );
        let coords: Vec<f64> = self.points.iter().flat_map(|p| [p[0], p[1]]).collect();
        store.store(
            &coords_path,
            &metadata,
            &[&self.pts_file],
            self.npt + 1,
            2,
            &coords,
        );
        Ok(())
    }

    fn load_triangles(&mut self, store: &mut ModelStore) -> Result<(), Error> {
        let metadata = vec![self.npt.to_string()];
        if let Some(cached) = store.cached(&self.trg_file, &metadata, &[&self.trg_file]) {
            if cached.rows != self.ntrg || cached.cols != 3 {
                return Err(Error::Definition(
                    "Cached triangulation has wrong shape".to_string(),
                ));
            }
            self.triangles = cached
                .values
                .chunks_exact(3)
                .map(|c| [c[0] as usize, c[1] as usize, c[2] as usize])
                .collect();
            return Ok(());
        }

        let spec = TableSpec::new(
            "trig_trg",
            &["ids[]=id1 int", "ids[]=id2 int", "ids[]=id3 int"],
        )?;
        let reader = TableReader::open(&spec, &store.file_name(&self.trg_file))?;

        self.triangles = Vec::with_capacity(self.ntrg);
        for record in reader {
            let record = record?;
            if self.triangles.len() >= self.ntrg {
                return Err(Error::Definition(format!(
                    "Too many triangles in triangulation model for {}",
                    self.name
                )));
            }
            let ids = record.group_ints("ids")?;
            for &id in &ids {
                if id < 1 || id > self.npt as i64 {
                    return Err(Error::Definition(format!(
                        "Invalid triangle point id {id} in {}",
                        self.name
                    )));
                }
            }
            self.triangles
                .push([ids[0] as usize, ids[1] as usize, ids[2] as usize]);
        }
        if self.triangles.len() != self.ntrg {
            return Err(Error::Definition(format!(
                "Not enough triangle definitions in trig file - expected {} found {} for {}",
                self.ntrg,
                self.triangles.len(),
                self.name
            )));
        }

        let flat: Vec<f64> = self
            .triangles
            .iter()
            .flat_map(|t| [t[0] as f64, t[1] as f64, t[2] as f64])
            .collect();
        store.store(&self.trg_file, &metadata, &[&self.trg_file], self.ntrg, 3, &flat);
        Ok(())
    }

    /// Validate the triangulation and precompute the interpolation
    /// machinery, through the cache when possible
    fn setup_triangulation(&mut self, store: &mut ModelStore) -> Result<(), Error> {
        let metadata = vec![self.points.len().to_string(), self.triangles.len().to_string()];
        let pts_file = self.pts_file.clone();
        let trg_file = self.trg_file.clone();
        let files = [pts_file.as_str(), trg_file.as_str()];
        let centroids_path = format!("{}.centroids", self.pts_file);
        let edgevec_path = format!("{}.edgevec", self.trg_file);
        let adjacent_path = format!("{}.adjacent", self.trg_file);

        let centroids = store.cached(&centroids_path, &metadata, &files);
        let edgevec = store.cached(&edgevec_path, &metadata, &files);
        let adjacent = store.cached(&adjacent_path, &metadata, &files);
        if let (Some(c), Some(e), Some(a)) = (centroids, edgevec, adjacent) {
            trace!("TIN {} triangulation loaded from binary cache", self.name);
            self.centroids = c.values.chunks_exact(2).map(|v| [v[0], v[1]]).collect();
            self.edgevec = e
                .values
                .chunks_exact(6)
                .map(|v| [[v[0], v[1]], [v[2], v[3]], [v[4], v[5]]])
                .collect();
            self.adjacent = a
                .values
                .chunks_exact(3)
                .map(|v| [v[0] as i64, v[1] as i64, v[2] as i64])
                .collect();
            return Ok(());
        }

        self.validate_and_precompute()?;

        let flat: Vec<f64> = self.centroids.iter().flat_map(|c| [c[0], c[1]]).collect();
        store.store(&centroids_path, &metadata, &files, self.ntrg, 2, &flat);
        let flat: Vec<f64> = self
            .edgevec
            .iter()
            .flat_map(|e| [e[0][0], e[0][1], e[1][0], e[1][1], e[2][0], e[2][1]])
            .collect();
        store.store(&edgevec_path, &metadata, &files, self.ntrg, 6, &flat);
        let flat: Vec<f64> = self
            .adjacent
            .iter()
            .flat_map(|a| [a[0] as f64, a[1] as f64, a[2] as f64])
            .collect();
        store.store(&adjacent_path, &metadata, &files, self.ntrg, 3, &flat);
        Ok(())
    }

    fn validate_and_precompute(&mut self) -> Result<(), Error> {
        let pts = &self.points;
        let trg = &self.triangles;

        // All triangles must be anticlockwise
        let mut areas = Vec::with_capacity(trg.len());
        let mut bad = 0usize;
        let mut first_bad = None;
        for t in trg {
            let area = cross(sub(pts[t[1]], pts[t[0]]), sub(pts[t[2]], pts[t[0]]));
            if area <= 0.0 && first_bad.is_none() {
                first_bad = Some((*t, area));
            }
            if area <= 0.0 {
                bad += 1;
            }
            areas.push(area);
        }
        if let Some((t, area)) = first_bad {
            return Err(Error::Definition(format!(
                "{bad} of {} triangles are clockwise eg {t:?} with area {area} in {}",
                trg.len(),
                self.name
            )));
        }

        // Build directed-edge adjacency: the neighbour across each edge of
        // a triangle is recorded opposite the corresponding vertex
        use std::collections::BTreeMap;
        let mut edges: BTreeMap<(usize, usize), (usize, usize)> = BTreeMap::new();
        for (nt, t) in trg.iter().enumerate() {
            for i in 0..3 {
                let edge = (t[(i + 1) % 3], t[(i + 2) % 3]);
                if edges.insert(edge, (nt, i)).is_some() {
                    return Err(Error::Definition(format!(
                        "Edge {} {} repeated in triangulation definition",
                        edge.0, edge.1
                    )));
                }
            }
        }

        self.adjacent = vec![[-1; 3]; trg.len()];
        let mut boundary: BTreeMap<usize, usize> = BTreeMap::new();
        let mut nedge = 0usize;
        let mut start = 0usize;
        for (&(from, to), &(nt, ne)) in &edges {
            if let Some(&(other, _)) = edges.get(&(to, from)) {
                self.adjacent[nt][ne] = other as i64;
            } else {
                nedge += 1;
                start = from;
                boundary.insert(from, to);
            }
        }

        // The unmatched edges must form a single convex loop
        let mut nloop = 0usize;
        let mut p0 = start;
        loop {
            let p1 = *boundary.get(&p0).ok_or_else(|| {
                Error::Definition(format!("Triangle boundary error at node {p0}"))
            })?;
            let p2 = *boundary.get(&p1).ok_or_else(|| {
                Error::Definition(format!("Triangle boundary error at node {p1}"))
            })?;
            let area = cross(sub(pts[p1], pts[p2]), sub(pts[p1], pts[p0]));
            if area < 0.0 {
                return Err(Error::Definition(format!(
                    "Triangulation boundary concave at node {p1}"
                )));
            }
            p0 = p1;
            nloop += 1;
            if p0 == start {
                break;
            }
            if nloop >= nedge {
                return Err(Error::Definition(
                    "Invalid triangulation boundary".to_string(),
                ));
            }
        }
        if nloop < nedge {
            return Err(Error::Definition(
                "Triangulation is not a single convex polygon".to_string(),
            ));
        }

        // Triangle centroids and edge vectors scaled by inverse area: the
        // barycentric weight for vertex i at point p is then
        // cross(edgevec[i], p - centroid) + 1/3
        self.centroids = trg
            .iter()
            .map(|t| {
                [
                    (pts[t[0]][0] + pts[t[1]][0] + pts[t[2]][0]) / 3.0,
                    (pts[t[0]][1] + pts[t[1]][1] + pts[t[2]][1]) / 3.0,
                ]
            })
            .collect();
        self.edgevec = trg
            .iter()
            .zip(areas.iter())
            .map(|(t, area)| {
                let mut e = [[0.0; 2]; 3];
                for i in 0..3 {
                    let v = sub(pts[t[(i + 2) % 3]], pts[t[(i + 1) % 3]]);
                    e[i] = [v[0] / area, v[1] / area];
                }
                e
            })
            .collect();
        Ok(())
    }

    /// Walk to the triangle containing `(x, y)`, returning its index, its
    /// three node rows and the barycentric weights
    fn find_triangle(&self, x: f64, y: f64) -> Result<(usize, [usize; 3], [f64; 3]), Error> {
        let mut start = 0usize;
        let mut best = f64::INFINITY;
        for (i, c) in self.centroids.iter().enumerate() {
            let d = (c[0] - x).hypot(c[1] - y);
            if d < best {
                best = d;
                start = i;
            }
        }

        let mut checked: Vec<usize> = Vec::new();
        let mut weights = [0.0; 3];
        loop {
            checked.push(start);
            let c = self.centroids[start];
            for i in 0..3 {
                weights[i] = cross(self.edgevec[start][i], [x - c[0], y - c[1]]) + 1.0 / 3.0;
            }

            // Step across the edge with the most negative weight
            let mut exit = None;
            let mut lowest = 0.0;
            for i in 0..3 {
                if weights[i] < lowest {
                    lowest = weights[i];
                    exit = Some(i);
                }
            }
            let Some(exit) = exit else {
                break;
            };
            let next = self.adjacent[start][exit];
            if next < 0 {
                return Err(Error::OutOfRange(format!(
                    "{x},{y} is out of range of triangulation"
                )));
            }
            if checked.contains(&(next as usize)) {
                break;
            }
            start = next as usize;
        }

        Ok((start, self.triangles[start], weights))
    }

    /// Barycentric interpolation at a point, as the canonical 5-tuple
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
                "{x0},{y} is out of range of TIN for {}",
                self.name
            )));
        }

        let (_, rows, weights) = self.find_triangle(x, y)?;
        self.data.calc_deformation(&rows, &weights)
    }

    /// Whether the point falls inside the triangulated region
    pub fn contains_point(&mut self, x: f64, y: f64, store: &mut ModelStore) -> bool {
        if self.load(store).is_err() {
            return false;
        }
        self.find_triangle(x, y).is_ok()
    }

    /// The triangles of the network: `(index, node ids, node coordinates)`
    pub fn triangles(
        &mut self,
        store: &mut ModelStore,
    ) -> Result<Vec<(usize, [usize; 3], [[f64; 2]; 3])>, Error> {
        self.load(store)?;
        Ok(self
            .triangles
            .iter()
            .enumerate()
            .map(|(i, t)| {
                (
                    i,
                    *t,
                    [self.points[t[0]], self.points[t[1]], self.points[t[2]]],
                )
            })
            .collect())
    }
}

// ----- T E S T S ------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn write(dir: &tempfile::TempDir, name: &str, content: &str) {
        std::fs::write(dir.path().join(name), content).unwrap();
    }

    // A unit square split along the diagonal, both triangles anticlockwise.
    // Deformation de equals the longitude so interpolation is easy to check.
    const POINTS: &str = "id,lon,lat,de\n\
        1,0.0,0.0,0.0\n\
        2,1.0,0.0,1.0\n\
        3,1.0,1.0,1.0\n\
        4,0.0,1.0,0.0\n";
    const TRIANGLES: &str = "id1,id2,id3\n1,2,3\n1,3,4\n";

    fn test_tin(store: &ModelStore) -> Result<Tin, Error> {
        Tin::new(
            store,
            "tin_pts.csv",
            "tin_trg.csv",
            0.0,
            1.0,
            0.0,
            1.0,
            4,
            2,
            &columns(&["de"]),
            "tin_pts.csv",
        )
    }

    fn test_store(points: &str, triangles: &str) -> ModelStore {
        let dir = tempfile::tempdir().unwrap();
        write(&dir, "tin_pts.csv", points);
        write(&dir, "tin_trg.csv", triangles);
        ModelStore::for_tests(dir, Cache::null())
    }

    #[test]
    fn barycentric_interpolation() -> Result<(), Error> {
        let mut store = test_store(POINTS, TRIANGLES);
        let mut tin = test_tin(&store)?;

        // A vertex returns its nodal value
        let d = tin.calc_deformation(0.0, 0.0, &mut store)?;
        assert!(d[0].abs() < 1e-12);

        // de is linear in lon across the whole square
        let d = tin.calc_deformation(0.25, 0.5, &mut store)?;
        assert!((d[0] - 0.25).abs() < 1e-12);
        let d = tin.calc_deformation(0.9, 0.2, &mut store)?;
        assert!((d[0] - 0.9).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn walk_and_range() -> Result<(), Error> {
        let mut store = test_store(POINTS, TRIANGLES);
        let mut tin = test_tin(&store)?;

        // The bounding box rejects points outright
        assert!(matches!(
            tin.calc_deformation(1.5, 0.5, &mut store),
            Err(Error::OutOfRange(_))
        ));

        // Longitude wrapping brings the point back in range
        let d = tin.calc_deformation(0.25 - 360.0, 0.5, &mut store)?;
        assert!((d[0] - 0.25).abs() < 1e-12);

        assert!(tin.contains_point(0.5, 0.5, &mut store));
        Ok(())
    }

    #[test]
    fn triangle_iteration() -> Result<(), Error> {
        let mut store = test_store(POINTS, TRIANGLES);
        let mut tin = test_tin(&store)?;

        let triangles = tin.triangles(&mut store)?;
        assert_eq!(triangles.len(), 2);
        let (index, ids, corners) = triangles[0];
        assert_eq!(index, 0);
        assert_eq!(ids, [1, 2, 3]);
        assert_eq!(corners, [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]]);
        let (_, ids, _) = triangles[1];
        assert_eq!(ids, [1, 3, 4]);
        Ok(())
    }

    #[test]
    fn clockwise_triangles_are_rejected() -> Result<(), Error> {
        let mut store = test_store(POINTS, "id1,id2,id3\n1,3,2\n1,3,4\n");
        let mut tin = test_tin(&store)?;
        let Err(Error::Definition(msg)) = tin.load(&mut store) else {
            panic!("expected a model definition error");
        };
        assert!(msg.contains("clockwise"), "{msg}");
        Ok(())
    }

    #[test]
    fn sequential_point_ids_required() -> Result<(), Error> {
        let shuffled = "id,lon,lat,de\n\
            1,0.0,0.0,0.0\n\
            3,1.0,0.0,1.0\n\
            2,1.0,1.0,1.0\n\
            4,0.0,1.0,0.0\n";
        let mut store = test_store(shuffled, TRIANGLES);
        let mut tin = test_tin(&store)?;
        assert!(matches!(tin.load(&mut store), Err(Error::Definition(_))));
        Ok(())
    }

    #[test]
    fn cache_round_trip() -> Result<(), Error> {
        let dir = tempfile::tempdir().unwrap();
        write(&dir, "tin_pts.csv", POINTS);
        write(&dir, "tin_trg.csv", TRIANGLES);
        let cache = Cache::open(&dir.path().join("cache.h5"));
        let mut store = ModelStore::for_tests(dir, cache);

        let mut tin = test_tin(&store)?;
        tin.load(&mut store)?;

        // A fresh TIN over the same store comes entirely from the cache
        let mut tin = test_tin(&store)?;
        let d = tin.calc_deformation(0.25, 0.5, &mut store)?;
        assert!((d[0] - 0.25).abs() < 1e-12);
        Ok(())
    }
}
