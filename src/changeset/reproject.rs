// ABOUTME: Geographic to projected coordinate conversion (transverse Mercator)
// ABOUTME: Default parameters are NZGD2000 (EPSG:4167) to NZTM2000 (EPSG:2193)

/// Transverse Mercator projection on an ellipsoid.
///
/// Uses the series expansion from Snyder, "Map Projections: A Working Manual"
/// (eqs. 8-9, 8-10, 3-21), which stays well under a centimetre across the
/// New Zealand mainland.
#[derive(Debug, Clone, PartialEq)]
pub struct TransverseMercator {
    /// Semi-major axis (metres)
    pub semi_major_axis: f64,
    /// Inverse flattening
    pub inverse_flattening: f64,
    /// Central meridian (degrees)
    pub central_meridian: f64,
    /// Latitude of origin (degrees)
    pub origin_latitude: f64,
    pub scale_factor: f64,
    pub false_easting: f64,
    pub false_northing: f64,
    /// EPSG code of the projected output
    pub srid: i32,
}

impl TransverseMercator {
    /// NZTM2000 on GRS80.
    pub fn nztm2000() -> Self {
        Self {
            semi_major_axis: 6_378_137.0,
            inverse_flattening: 298.257_222_101,
            central_meridian: 173.0,
            origin_latitude: 0.0,
            scale_factor: 0.9996,
            false_easting: 1_600_000.0,
            false_northing: 10_000_000.0,
            srid: 2193,
        }
    }

    fn eccentricity_squared(&self) -> f64 {
        let f = 1.0 / self.inverse_flattening;
        2.0 * f - f * f
    }

    /// Distance along the meridian from the equator to latitude `phi` (radians).
    fn meridian_arc(&self, phi: f64) -> f64 {
        let e2 = self.eccentricity_squared();
        let e4 = e2 * e2;
        let e6 = e4 * e2;
        self.semi_major_axis
            * ((1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * phi
                - (3.0 * e2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * phi).sin()
                + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * phi).sin()
                - (35.0 * e6 / 3072.0) * (6.0 * phi).sin())
    }

    /// Project a longitude/latitude pair (degrees) to easting/northing (metres).
    pub fn forward(&self, longitude: f64, latitude: f64) -> (f64, f64) {
        let e2 = self.eccentricity_squared();
        let ep2 = e2 / (1.0 - e2);
        let k0 = self.scale_factor;

        let phi = latitude.to_radians();
        let lambda = longitude.to_radians();
        let lambda0 = self.central_meridian.to_radians();

        let sin_phi = phi.sin();
        let cos_phi = phi.cos();
        let tan_phi = phi.tan();

        let n = self.semi_major_axis / (1.0 - e2 * sin_phi * sin_phi).sqrt();
        let t = tan_phi * tan_phi;
        let c = ep2 * cos_phi * cos_phi;
        let a = (lambda - lambda0) * cos_phi;
        let m = self.meridian_arc(phi);
        let m0 = self.meridian_arc(self.origin_latitude.to_radians());

        let a2 = a * a;
        let a3 = a2 * a;
        let a4 = a3 * a;
        let a5 = a4 * a;
        let a6 = a5 * a;

        let x = k0
            * n
            * (a + (1.0 - t + c) * a3 / 6.0
                + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * ep2) * a5 / 120.0);
        let y = k0
            * (m - m0
                + n * tan_phi
                    * (a2 / 2.0
                        + (5.0 - t + 9.0 * c + 4.0 * c * c) * a4 / 24.0
                        + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * ep2) * a6 / 720.0));

        (self.false_easting + x, self.false_northing + y)
    }
}

impl Default for TransverseMercator {
    fn default() -> Self {
        Self::nztm2000()
    }
}
