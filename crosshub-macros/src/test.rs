use proc_macro2::{Ident, Span, TokenStream};
use quote::quote;
use syn::ItemFn;

// Much of this code is adapted from https://github.com/tokio-rs/tokio/blob/910a1e2fcf8ebafd41c2841144c3a1037af7dc40/tokio-macros/src/lib.rs.

pub(crate) fn test_macro(_args: TokenStream, item: TokenStream) -> TokenStream {
    let mut input: ItemFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return token_stream_with_error(item, e),
    };

    // Take the name of the test function as written.
    let test_name = input.sig.ident;
    // Rename the test function to "inner". We will add it as an inner function of our actual test and call it.
    let inner_name = Ident::new("inner", Span::call_site());
    input.sig.ident = inner_name.clone();

    quote! {
        #[tokio::test(flavor = "multi_thread")]
        async fn #test_name() {
            // The original test function
            #input

            // Work out what RNG seeds to run the test with.
            let seeds: Vec<u64> = if let Some(seed) = std::env::var_os("CROSSHUB_TEST_RNG_SEED") {
                vec![seed.to_str().unwrap().parse().unwrap()]
            } else {
                let samples: u64 = std::env::var_os("CROSSHUB_TEST_SAMPLES")
                    .map(|s| s.to_str().unwrap().parse().expect(&format!("Failed to parse CROSSHUB_TEST_SAMPLES env var: {:?}", s)))
                    .unwrap_or(1);
                (0..samples).collect()
            };

            for seed in seeds {
                // Set up a tracing subscriber, so we can see logs from failed test cases.
                let subscriber = tracing_subscriber::fmt()
                    .with_ansi(false)
                    .with_test_writer()
                    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env());
                let _guard = tracing_subscriber::util::SubscriberInitExt::set_default(subscriber);

                let rng = <rand_chacha::ChaCha8Rng as rand::SeedableRng>::seed_from_u64(seed);

                // Call the original test function, wrapped in `catch_unwind` so we can report the seed on failure.
                let result = futures::FutureExt::catch_unwind(std::panic::AssertUnwindSafe(#inner_name(rng))).await;

                if let Err(e) = result {
                    println!("Reproduce this test run by setting CROSSHUB_TEST_RNG_SEED={seed}");
                    std::panic::resume_unwind(e);
                }
            }
        }
    }
}

// If any of the steps for this macro fail, we still want to expand to an item that is as close to the expected output
// as possible. This helps out IDEs such that completions and other related features keep working.
fn token_stream_with_error(mut tokens: TokenStream, error: syn::Error) -> TokenStream {
    tokens.extend(error.into_compile_error());
    tokens
}
