//! Dutch Rijksdriehoek (RD) to WGS84 approximation.
//!
//! Polynomial fit around the Amersfoort reference point; accurate to roughly a
//! metre within the Netherlands.

const REFERENCE_X: f64 = 155_000.0;
const REFERENCE_Y: f64 = 463_000.0;
const REFERENCE_LAT: f64 = 52.155_17;
const REFERENCE_LON: f64 = 5.387_206;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatLon {
    pub latitude: f64,
    pub longitude: f64,
}

pub fn rd_to_wgs84(x: f64, y: f64) -> LatLon {
    let dx = (x - REFERENCE_X) * 1e-5;
    let dy = (y - REFERENCE_Y) * 1e-5;

    let dx2 = dx * dx;
    let dx3 = dx2 * dx;
    let dx4 = dx3 * dx;
    let dx5 = dx4 * dx;
    let dy2 = dy * dy;
    let dy3 = dy2 * dy;
    let dy4 = dy3 * dy;

    let north = 3235.65389 * dy - 32.58297 * dx2 - 0.2475 * dy2 - 0.84978 * dx2 * dy
        - 0.0655 * dy3
        - 0.01709 * dx2 * dy2
        - 0.00738 * dx
        + 0.0053 * dx4
        - 0.00039 * dx2 * dy3
        + 0.00033 * dx4 * dy
        - 0.00012 * dx * dy;
    let east = 5260.52916 * dx + 105.94684 * dx * dy + 2.45656 * dx * dy2 - 0.81885 * dx3
        + 0.05594 * dx * dy3
        - 0.05607 * dx3 * dy
        + 0.01199 * dy
        - 0.00256 * dx3 * dy2
        + 0.00128 * dx * dy4
        + 0.00022 * dy2
        - 0.00022 * dx2
        + 0.00026 * dx5;

    LatLon {
        latitude: REFERENCE_LAT + north / 3600.0,
        longitude: REFERENCE_LON + east / 3600.0,
    }
}
