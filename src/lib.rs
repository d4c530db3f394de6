extern crate rand;
#[macro_use]
extern crate serde_derive;
extern crate serde;
extern crate serde_json;
extern crate rayon;

extern crate byteorder;
extern crate image;
extern crate imageproc;

#[macro_use]
extern crate log;
#[macro_use]
extern crate error_chain;

macro_rules! max {
    ($x: expr, $y: expr) => {{
        let (x, y) = ($x, $y);
        if x > y { x } else { y }
    }}
}

macro_rules! min {
    ($x: expr, $y: expr) => {{
        let (x, y) = ($x, $y);
        if x < y { x } else { y }
    }}
}

/// Ratio of two counts
macro_rules! rel {
    ($a: expr, $b: expr) => (($a as f64) / ($b as f64))
}

/// Natural logarithm with ln(0) = 0, so that 0 * ln(0) vanishes in entropies
macro_rules! ln {
    ($x: expr) => {{
        let x = $x;
        if x == 0f64 { 0f64 } else { x.ln() }
    }}
}

pub mod errors;
pub mod config;
pub mod types;

/// Defines a hough forest with entangled split functions.
/// For literature see
/// * https://pages.iai.uni-bonn.de/gall_juergen/download/jgall_houghforest_cvpr09.pdf
/// * http://www.cs.cmu.edu/~ynakamur/papers/Yoshida_Entangled_Decision_Forests_CVPR2013.pdf
pub mod hough;
