//! Test attributes that fail a test when it outlives a wall-clock budget.
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test]            // 60s, current-thread runtime
//! #[test_timeout::tokio_timeout_test(10)]        // 10s
//! #[test_timeout::tokio_timeout_test(10, multi_thread)]
//! #[test_timeout::timeout(5)]                    // synchronous test
//! ```
//!
//! The body runs on its own thread so a test stuck in a blocking call still
//! reports a timeout instead of hanging the harness.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

enum Flavor {
    CurrentThread,
    MultiThread,
}

struct TimeoutArgs {
    secs: u64,
    flavor: Flavor,
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TimeoutArgs {
            secs: DEFAULT_TIMEOUT_SECS,
            flavor: Flavor::CurrentThread,
        };
        if input.is_empty() {
            return Ok(args);
        }
        if input.peek(LitInt) {
            let lit: LitInt = input.parse()?;
            args.secs = lit.base10_parse()?;
            if args.secs == 0 {
                return Err(syn::Error::new(lit.span(), "timeout must be greater than zero"));
            }
            if input.is_empty() {
                return Ok(args);
            }
            input.parse::<Token![,]>()?;
        }
        let flavor: Ident = input.parse()?;
        args.flavor = match flavor.to_string().as_str() {
            "current_thread" => Flavor::CurrentThread,
            "multi_thread" => Flavor::MultiThread,
            _ => {
                return Err(syn::Error::new(
                    flavor.span(),
                    "expected `current_thread` or `multi_thread`",
                ))
            }
        };
        if !input.is_empty() {
            return Err(input.error("unexpected tokens after runtime flavor"));
        }
        Ok(args)
    }
}

/// Runs `body` on a fresh thread and panics if it has not reported back
/// within `secs`. Panics from the body are resumed on the test thread.
fn guarded(secs: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let budget = ::std::time::Duration::from_secs(#secs);
        let (report, outcome) = ::std::sync::mpsc::channel();
        ::std::thread::spawn(move || {
            let result = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| { #body }));
            let _ = report.send(result);
        });
        match outcome.recv_timeout(budget) {
            Ok(Ok(())) => {}
            Ok(Err(payload)) => ::std::panic::resume_unwind(payload),
            Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test exceeded its {}s budget", #secs)
            }
            Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread exited without reporting")
            }
        }
    }
}

fn strip_attrs(attrs: Vec<Attribute>, is_test_marker: fn(&Attribute) -> bool) -> Vec<Attribute> {
    attrs.into_iter().filter(|attr| !is_test_marker(attr)).collect()
}

fn path_is(attr: &Attribute, expected: &[&str]) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    segments.len() == expected.len() && segments.iter().zip(expected).all(|(a, b)| a == b)
}

fn is_tokio_test(attr: &Attribute) -> bool {
    path_is(attr, &["tokio", "test"])
}

fn is_plain_test(attr: &Attribute) -> bool {
    path_is(attr, &["test"])
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.take().is_none() {
        return syn::Error::new_spanned(&sig.ident, "tokio_timeout_test expects an async fn")
            .to_compile_error()
            .into();
    }
    let attrs = strip_attrs(attrs, is_tokio_test);
    let builder = match args.flavor {
        Flavor::CurrentThread => quote!(::tokio::runtime::Builder::new_current_thread()),
        Flavor::MultiThread => quote!(::tokio::runtime::Builder::new_multi_thread()),
    };
    let secs = args.secs;
    let body = quote! {
        let runtime = #builder
            .enable_all()
            .build()
            .expect("failed to build test runtime");
        runtime.block_on(async move {
            if ::tokio::time::timeout(::std::time::Duration::from_secs(#secs), async move #block)
                .await
                .is_err()
            {
                panic!("test exceeded its {}s budget", #secs);
            }
        });
    };
    let guarded = guarded(secs, body);

    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #guarded
        }
    }
    .into()
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(&sig.ident, "timeout expects a synchronous fn; use tokio_timeout_test")
            .to_compile_error()
            .into();
    }
    let attrs = strip_attrs(attrs, is_plain_test);
    let guarded = guarded(args.secs, quote!(#block;));

    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #guarded
        }
    }
    .into()
}
