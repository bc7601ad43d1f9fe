//! Reference entities: an axial bar element and two single-DOF conditions.

pub mod bar;
pub mod point_load;
pub mod spring;

pub use bar::Bar1D;
pub use point_load::PointLoad;
pub use spring::GroundSpring;
