mod test;

use proc_macro::TokenStream;

/// Runs an async integration test on a multi-threaded tokio runtime.
///
/// The test function must take a single `rand_chacha::ChaCha8Rng` argument. It is run once per seed. Seeds are
/// taken from `CROSSHUB_TEST_RNG_SEED` if set, otherwise `0..CROSSHUB_TEST_SAMPLES` (default 1).
#[proc_macro_attribute]
pub fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    test::test_macro(args.into(), item.into()).into()
}
