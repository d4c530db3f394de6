/// Train a hough forest on grayscale images with object masks

extern crate entangled_hough;
extern crate clap;
#[macro_use]
extern crate log;
extern crate env_logger;
extern crate image;
#[macro_use]
extern crate error_chain;

use entangled_hough::config::LearnerConfig;
use entangled_hough::hough::ForestLearner;
use entangled_hough::types::{FeatureTensor, ObjectRegion, PatchGrid};
use clap::{Arg, App};
use std::str::FromStr;
use std::sync::Arc;

macro_rules! eprintln {
    ($e: expr, $($args: expr)*) => {
        use std::io::{stderr, Write};
        let mut out = stderr();
        let mut out = out.lock();
        out.write_fmt(format_args!($e, $($args,)*)).unwrap();
    };
}

error_chain!{
    links {
        Hough(entangled_hough::errors::Error, entangled_hough::errors::ErrorKind);
    }
    foreign_links {
        Image(image::ImageError);
        IO(std::io::Error);
        Parse(std::num::ParseIntError);
    }
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
    let args = App::new("Hough forest learner")
        .arg(Arg::with_name("image")
            .short("i")
            .long("image")
            .required(true)
            .takes_value(true)
            .multiple(true)
            .help("Training image and its object mask, separated by a comma (image.png,mask.png)"))
        .arg(Arg::with_name("out_filename")
            .short("o")
            .long("out")
            .takes_value(true)
            .required(true)
            .help("Filename for the trained forest"))
        .arg(Arg::with_name("config")
            .short("c")
            .long("config")
            .takes_value(true)
            .help("JSON file with the learner configuration"))
        .arg(Arg::with_name("trees")
            .long("trees")
            .takes_value(true)
            .help("Number of trees for the forest"))
        .arg(Arg::with_name("maxdepth")
            .long("maxdepth")
            .takes_value(true)
            .help("Max depth a tree may be grown"))
        .arg(Arg::with_name("seed")
            .long("seed")
            .takes_value(true)
            .help("Seed for reproducible training"))
        .get_matches();

    let mut config = match args.value_of("config") {
        Some(path) => LearnerConfig::load(path)?,
        None => LearnerConfig::default(),
    };
    if let Some(x) = args.value_of("trees") {
        config = config.trees(usize::from_str(x)?);
    }
    if let Some(x) = args.value_of("maxdepth") {
        config = config.depth(usize::from_str(x)?);
    }
    if let Some(x) = args.value_of("seed") {
        config = config.seed(u64::from_str(x)?);
    }
    let filename = args.value_of("out_filename").ok_or("No valid output filename")?;
    let learner = ForestLearner::new(config)?;

    let mut records = vec![];
    for (i, pair) in args.values_of("image").ok_or("No training images")?.enumerate() {
        let mut paths = pair.split(',');
        let (img_path, mask_path) = match (paths.next(), paths.next()) {
            (Some(a), Some(b)) => (a, b),
            _ => bail!("Expected image.png,mask.png but got {}", pair),
        };
        info!("Reading {}", img_path);
        let img = image::open(img_path)?.to_luma8();
        let mask = image::open(mask_path)?.to_luma8();
        let region = ObjectRegion::from_mask(&mask).ok_or_else(|| format!("{} is empty", mask_path))?;
        let cfg = learner.config();
        let grid = PatchGrid::new(Arc::new(FeatureTensor::from_luma(&img)), cfg.patch_size, cfg.stride)?;
        records.extend(grid.labeled_records(i, &[region]));
    }

    info!("Starting Learning");
    let forest = learner.train(&records)?;
    info!("Learned sucessfull");
    learner.config().save(format!("{}_param.json", filename))?;
    forest.save(filename)?;
    Ok(())
}
