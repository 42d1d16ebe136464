//! `#[tokio_timeout_test]`: an async test on a multi-threaded runtime that
//! fails instead of hanging when it overruns its deadline.
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test(secs = 5, worker_threads = 2)]
//! async fn handshake() { /* ... */ }
//! ```
//!
//! A bare integer is accepted as shorthand for `secs`.

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_SECS: u64 = 30;
const DEFAULT_WORKERS: usize = 2;

struct Options {
    secs: u64,
    worker_threads: usize,
}

struct Setting {
    key: Ident,
    value: LitInt,
}

impl Parse for Setting {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let key = input.parse()?;
        input.parse::<Token![=]>()?;
        let value = input.parse()?;
        Ok(Self { key, value })
    }
}

impl Parse for Options {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut options = Options {
            secs: DEFAULT_SECS,
            worker_threads: DEFAULT_WORKERS,
        };
        if input.is_empty() {
            return Ok(options);
        }
        if input.peek(LitInt) {
            let lit: LitInt = input.parse()?;
            options.secs = positive(&lit)?;
            return Ok(options);
        }
        for setting in Punctuated::<Setting, Token![,]>::parse_terminated(input)? {
            match setting.key.to_string().as_str() {
                "secs" => options.secs = positive(&setting.value)?,
                "worker_threads" => options.worker_threads = positive(&setting.value)?,
                other => {
                    return Err(syn::Error::new(
                        setting.key.span(),
                        format!("unknown setting `{other}`, expected `secs` or `worker_threads`"),
                    ));
                }
            }
        }
        Ok(options)
    }
}

fn positive<N>(lit: &LitInt) -> syn::Result<N>
where
    N: std::str::FromStr + PartialEq + From<u8>,
    N::Err: std::fmt::Display,
{
    let value: N = lit.base10_parse()?;
    if value == N::from(0) {
        return Err(syn::Error::new(lit.span(), "value must be greater than zero"));
    }
    Ok(value)
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let Options {
        secs,
        worker_threads,
    } = parse_macro_input!(attr as Options);

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

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();
    let name = sig.ident.to_string();
    let thread_name = syn::LitStr::new(&name, Span::call_site());

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let deadline = std::time::Duration::from_secs(#secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::Builder::new()
                .name(#thread_name.to_string())
                .spawn(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        let runtime = tokio::runtime::Builder::new_multi_thread()
                            .worker_threads(#worker_threads)
                            .enable_all()
                            .build()
                            .expect("failed to build Tokio runtime");
                        runtime.block_on(async {
                            tokio::time::timeout(deadline, async move #block)
                                .await
                                .expect("test timed out");
                        });
                        runtime.shutdown_timeout(std::time::Duration::from_millis(100));
                    }));
                    let _ = sender.send(result);
                })
                .expect("failed to spawn test thread");
            // a little slack so the in-runtime timeout reports first
            match receiver.recv_timeout(deadline + std::time::Duration::from_secs(1)) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
