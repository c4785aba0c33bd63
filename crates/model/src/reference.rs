use util::id::HasId;

/// Default search radii for the spatial predicates. `at_terminal` gets a
/// wider radius to cover the approach zone of a terminal stop.
pub const NEAR_STOP_RADIUS_M: f64 = 50.0;
pub const NEAR_INTERSECTION_RADIUS_M: f64 = 50.0;
pub const TERMINAL_RADIUS_M: f64 = 75.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub lat: f64,
    pub lon: f64,
}

/// A passenger boarding platform.
#[derive(Debug, Clone, PartialEq)]
pub struct Stop {
    pub id: String,
    pub name: String,
    pub point: Point,
    /// Whether this stop is a terminal for at least one line. The
    /// line-specific pairing still lives on `LineTerminal`; this is a
    /// quick, line-agnostic flag carried on the stop itself.
    pub is_terminal: bool,
}

impl HasId for Stop {
    type IdType = String;
}

/// A point where tram rails cross a road, presumed signal-controlled.
#[derive(Debug, Clone, PartialEq)]
pub struct Intersection {
    pub id: i64,
    pub name: Option<String>,
    pub point: Point,
}

impl HasId for Intersection {
    type IdType = i64;
}

/// A stop that is the first or last stop on a specific line's trip. A stop
/// may be a terminal for one line while being a regular stop for another —
/// the pairing is what makes the check line-specific.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LineTerminal {
    pub line: String,
    pub stop_id: String,
}
