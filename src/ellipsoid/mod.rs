//! The biaxial ellipsoid underlying the model datum.
//!
//! The evaluator needs very little of geodesy proper: the metres-per-degree
//! scale factors that convert east/north displacements to longitude/latitude
//! shifts, and the geographic/cartesian conversions backing the XYZ
//! convenience closures. Coordinates here are degrees and metres, matching
//! the model files.

use std::f64::consts::PI;

/// An ellipsoid of revolution, defined by semimajor axis and flattening
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Ellipsoid {
    a: f64,
    f: f64,
}

impl Ellipsoid {
    #[must_use]
    pub fn new(semimajor_axis: f64, flattening: f64) -> Ellipsoid {
        Ellipsoid {
            a: semimajor_axis,
            f: flattening,
        }
    }

    /// From the `(a, 1/f)` pair the model metadata carries.
    /// EPSG convention: zero reciproque flattening indicates zero flattening
    #[must_use]
    pub fn from_a_rf(semimajor_axis: f64, inverse_flattening: f64) -> Ellipsoid {
        let f = if inverse_flattening != 0.0 {
            1.0 / inverse_flattening
        } else {
            inverse_flattening
        };
        Ellipsoid::new(semimajor_axis, f)
    }

    /// The semimajor axis, *a*
    #[must_use]
    pub fn semimajor_axis(&self) -> f64 {
        self.a
    }

    /// The flattening, *f*
    #[must_use]
    pub fn flattening(&self) -> f64 {
        self.f
    }

    /// The semiminor axis, *b = a(1 - f)*
    #[must_use]
    pub fn semiminor_axis(&self) -> f64 {
        self.a * (1.0 - self.f)
    }

    // First eccentricity squared
    fn e2(&self) -> f64 {
        self.f * (2.0 - self.f)
    }

    // Radius of curvature in the prime vertical at a latitude given by
    // its sine
    fn nu(&self, sin_lat: f64) -> f64 {
        self.a / (1.0 - self.e2() * sin_lat * sin_lat).sqrt()
    }

    /// Metres per degree of longitude and latitude at a point, as the pair
    /// `(dedln, dndlt)`. Longitude is irrelevant on an ellipsoid of
    /// revolution but kept in the signature for symmetry with the
    /// coordinates it is applied to.
    #[must_use]
    pub fn metres_per_degree(&self, _longitude: f64, latitude: f64) -> (f64, f64) {
        let lat = latitude.to_radians();
        let (sin_lat, cos_lat) = lat.sin_cos();
        let e2 = self.e2();
        let w2 = 1.0 - e2 * sin_lat * sin_lat;
        // Curvature radii in the prime vertical and the meridian
        let nu = self.a / w2.sqrt();
        let rho = nu * (1.0 - e2) / w2;
        let scale = PI / 180.0;
        (nu * cos_lat * scale, rho * scale)
    }

    /// Geographic to earth-centred cartesian coordinates: degrees and
    /// metres in, `[X, Y, Z]` metres out
    #[must_use]
    pub fn xyz(&self, longitude: f64, latitude: f64, height: f64) -> [f64; 3] {
        let lon = longitude.to_radians();
        let lat = latitude.to_radians();
        let (sin_lat, cos_lat) = lat.sin_cos();
        let nu = self.nu(sin_lat);
        [
            (nu + height) * cos_lat * lon.cos(),
            (nu + height) * cos_lat * lon.sin(),
            (nu * (1.0 - self.e2()) + height) * sin_lat,
        ]
    }

    /// Earth-centred cartesian to geographic coordinates, the inverse of
    /// [Ellipsoid::xyz]. Returns `(longitude, latitude, height)` in degrees
    /// and metres.
    ///
    /// The geodetic latitude is found by fixed-point iteration of
    /// `tan(lat) = (Z + e² ν(lat) sin(lat)) / p`; for earth-like
    /// flattenings the contraction is of order e²/2 per round, so double
    /// precision is reached within a handful of iterations.
    #[must_use]
    pub fn geodetic(&self, xyz: [f64; 3]) -> (f64, f64, f64) {
        let [x, y, z] = xyz;
        let e2 = self.e2();
        let lon = y.atan2(x);
        let p = x.hypot(y);

        // On the rotation axis the longitude is arbitrary, the latitude is
        // a pole, and the height is measured from the semiminor axis
        if p < 1.0e-9 {
            return (
                lon.to_degrees(),
                90.0_f64.copysign(z),
                z.abs() - self.semiminor_axis(),
            );
        }

        // First approximation: the geocentric latitude scaled by 1/(1 - e²)
        let mut lat = (z / (p * (1.0 - e2))).atan();
        for _ in 0..10 {
            let sin_lat = lat.sin();
            let next = (z + e2 * self.nu(sin_lat) * sin_lat).atan2(p);
            let done = (next - lat).abs() < 1.0e-14;
            lat = next;
            if done {
                break;
            }
        }

        // Two height expressions, each exact given the latitude; use the
        // better conditioned one
        let (sin_lat, cos_lat) = lat.sin_cos();
        let nu = self.nu(sin_lat);
        let height = if cos_lat.abs() >= sin_lat.abs() {
            p / cos_lat - nu
        } else {
            z / sin_lat - nu * (1.0 - e2)
        };

        (lon.to_degrees(), lat.to_degrees(), height)
    }
}

// ----- T E S T S ------------------------------------------------------------------
