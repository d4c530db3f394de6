//! Errors of this crate.

error_chain!{
    foreign_links {
        Io(::std::io::Error);
        Json(::serde_json::Error);
        ThreadPool(::rayon::ThreadPoolBuildError);
    }

    errors {
        /// A configuration value is out of its valid range.
        InvalidConfig(msg: String) {
            description("invalid configuration")
            display("Invalid configuration: {}", msg)
        }
        /// The records handed to the learner can not be used for training.
        InvalidTrainingSet(msg: String) {
            description("invalid training set")
            display("Invalid training set: {}", msg)
        }
        /// A tree stayed a bare leaf for every attempt.
        TreeTrainingFailed(tree: usize, attempts: usize) {
            description("learning of a hough tree failed")
            display("Learning of hough tree no. {} failed {} times. Check training data and parameter settings.",
                    tree, attempts)
        }
        Canceled {
            description("canceled")
            display("The operation was canceled")
        }
        /// The feature tensor does not have the channels the forest was trained with.
        ChannelMismatch(expected: usize, found: usize) {
            description("wrong number of feature channels")
            display("The forest expects {} feature channels, the image has {}", expected, found)
        }
        InvalidForestFormat(msg: String) {
            description("invalid forest format")
            display("Invalid forest format: {}", msg)
        }
    }
}
