use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Coordinates outside the unit square: x={x} y={y} w={width} h={height}")]
    InvalidCoordinates {
        x: f64,
        y: f64,
        width: f64,
        height: f64,
    },

    #[error("Malformed field reference: {0}")]
    InvalidFieldRef(String),

    #[error("History chain broken at event {index}")]
    BrokenHistory { index: usize },
}
