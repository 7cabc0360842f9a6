use proc_macro::TokenStream;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// One entry of the attribute list: either the timeout in seconds or the
/// `paused` flag that starts the runtime with a frozen, auto-advancing clock.
enum TimeoutArg {
    Seconds(u64),
    Paused,
}

impl Parse for TimeoutArg {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.peek(LitInt) {
            let lit: LitInt = input.parse()?;
            let secs: u64 = lit.base10_parse()?;
            if secs == 0 {
                return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
            }
            return Ok(TimeoutArg::Seconds(secs));
        }
        let ident: Ident = input.parse()?;
        if ident == "paused" {
            Ok(TimeoutArg::Paused)
        } else {
            Err(syn::Error::new_spanned(
                ident,
                "expected a timeout in seconds or `paused`",
            ))
        }
    }
}

struct TimeoutArgs {
    secs: u64,
    paused: bool,
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TimeoutArgs {
            secs: DEFAULT_TIMEOUT_SECS,
            paused: false,
        };
        let items = Punctuated::<TimeoutArg, Token![,]>::parse_terminated(input)?;
        for item in items {
            match item {
                TimeoutArg::Seconds(secs) => args.secs = secs,
                TimeoutArg::Paused => args.paused = true,
            }
        }
        Ok(args)
    }
}

/// Runs an async test on a dedicated current-thread runtime and fails it if
/// it does not finish within the wall-clock budget.
///
/// `#[tokio_timeout_test]`, `#[tokio_timeout_test(20)]` and
/// `#[tokio_timeout_test(20, paused)]` are accepted. With `paused` the
/// runtime starts with tokio's clock frozen, so timer-heavy session tests
/// run instantly while the wall-clock guard still catches livelocks.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let TimeoutArgs { secs, paused } = parse_macro_input!(attr as TimeoutArgs);

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }

    sig.asyncness = None;

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();

    // A paused clock auto-advances, so only the thread guard below measures
    // real time in that mode.
    let body = if paused {
        quote! { async move #block .await; }
    } else {
        quote! {
            tokio::time::timeout(wall_clock, async move #block)
                .await
                .expect("test timed out");
        }
    };

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let wall_clock = std::time::Duration::from_secs(#secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .start_paused(#paused)
                        .build()
                        .expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        #body
                    });
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(wall_clock) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn is_test_attribute(attr: &Attribute) -> bool {
    let segments: Vec<_> = attr.path().segments.iter().collect();
    match segments.as_slice() {
        [only] => only.ident == "test",
        [first, second] => first.ident == "tokio" && second.ident == "test",
        _ => false,
    }
}
