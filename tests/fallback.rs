mod support;

use hyfixes_early::{
    ConfigSnapshot, FailureKind, Outcome, TransformerPipeline, declared_class_name,
};
use jclassfile::class_file;
use proptest::prelude::*;

use support::fixtures::{WORLD, world_class};

fn pipeline() -> TransformerPipeline {
    TransformerPipeline::from_config(&ConfigSnapshot::default())
}

#[test]
fn garbage_is_returned_as_malformed_input() {
    let result = pipeline().apply(WORLD, b"not a class file");

    assert_eq!(b"not a class file".to_vec(), result.bytes);
    assert_eq!(
        Outcome::Failed(FailureKind::MalformedInput),
        result.diagnostics[0].outcome
    );
}

#[test]
fn invalid_class_name_is_rejected_without_parsing() {
    let input = world_class();

    let result = pipeline().apply("com.hypixel..World", &input);

    assert_eq!(input, result.bytes);
    assert_eq!(Outcome::Rejected, result.diagnostics[0].outcome);
}

proptest! {
    #[test]
    fn truncated_input_is_returned_unchanged(cut in 0usize..1000) {
        let full = world_class();
        let input = full[..cut % full.len()].to_vec();

        let result = pipeline().apply(WORLD, &input);

        prop_assert_eq!(input, result.bytes);
        prop_assert!(!result.applied);
    }

    #[test]
    fn corrupted_input_yields_input_or_loadable_class(
        position in 0usize..1000,
        value in any::<u8>(),
    ) {
        let mut input = world_class();
        let position = position % input.len();
        input[position] = value;

        let result = pipeline().apply(WORLD, &input);

        if result.applied {
            if class_file::parse(&input).is_ok() {
                prop_assert!(class_file::parse(&result.bytes).is_ok());
            }
            prop_assert!(declared_class_name(&result.bytes).is_ok());
        } else {
            prop_assert_eq!(input, result.bytes);
        }
    }
}
