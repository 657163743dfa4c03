mod ownership;

pub use ownership::*;
