/// Show the vote map of a trained hough forest for a grayscale image

extern crate entangled_hough;
extern crate clap;
#[macro_use]
extern crate log;
extern crate env_logger;
extern crate image;

#[macro_use]
extern crate error_chain;

use std::sync::Arc;

use clap::{Arg, App};
use image::{GrayImage, Luma};

use entangled_hough::config::PredictorConfig;
use entangled_hough::hough::{HoughForest, Predictor};
use entangled_hough::types::FeatureTensor;

error_chain!{
    links {
        Hough(entangled_hough::errors::Error, entangled_hough::errors::ErrorKind);
    }
    foreign_links {
        Image(image::ImageError);
        IO(std::io::Error);
    }
}

macro_rules! eprintln {
    ($e: expr, $($args: expr)*) => {
        use std::io::{stderr, Write};
        let mut out = stderr();
        let mut out = out.lock();
        out.write_fmt(format_args!($e, $($args,)*)).unwrap();
    };
}

pub fn main(){
    use std::process::exit;
    if let Err(e) = main_(){
        eprintln!("Error: {}\n",e);
        exit(-1);
    }
}

pub fn main_() -> Result<()> {
    env_logger::init();
    let args = App::new("Show hough votes")
        .arg(Arg::with_name("forest")
            .short("f")
            .long("forest")
            .required(true)
            .takes_value(true)
            .help("Trained forest"))
        .arg(Arg::with_name("image")
            .short("i")
            .long("image")
            .required(true)
            .takes_value(true)
            .help("Grayscale image"))
        .arg(Arg::with_name("config")
            .short("c")
            .long("config")
            .takes_value(true)
            .help("JSON file with the predictor configuration"))
        .arg(Arg::with_name("out")
            .short("o")
            .long("out")
            .takes_value(true)
            .help("Write the vote map of the first scale as png"))
        .arg(Arg::with_name("dump")
            .long("dump")
            .help("Print the trees"))
        .get_matches();

    let forest = HoughForest::load(args.value_of("forest").ok_or("Invalid forest file")?)?;
    if args.is_present("dump") {
        println!("{}", forest);
    }
    let config = match args.value_of("config") {
        Some(path) => PredictorConfig::load(path)?,
        None => PredictorConfig::default(),
    };
    let img = image::open(args.value_of("image").ok_or("Invalid image file")?)?.to_luma8();
    let tensor = Arc::new(FeatureTensor::from_luma(&img));
    let predictor = Predictor::new(forest, config)?;
    let result = predictor.detect(&tensor)?;

    for d in result.detections.iter() {
        let [x, y] = d.maximum.position;
        match d.bounding_box {
            Some(b) => {
                println!("Object at ({}, {}), votes {:.2}, box ({}, {}) {}x{}",
                         x, y, d.maximum.value, b.x(), b.y(), b.width(), b.height())
            }
            None => println!("Maximum at ({}, {}) without support", x, y),
        }
    }

    if let (Some(out), Some(votes)) = (args.value_of("out"), result.votes.first()) {
        let max = votes.pixels().map(|p| p.0[0]).fold(0f32, |a, b| if b > a { b } else { a });
        let scale = if max > 0.0 { 255.0 / max } else { 0.0 };
        let img = GrayImage::from_fn(votes.width(), votes.height(), |x, y| {
            Luma([(votes.get_pixel(x, y).0[0] * scale) as u8])
        });
        img.save(out)?;
        info!("Wrote {}", out);
    }
    Ok(())
}
