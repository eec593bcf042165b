use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{meta::ParseNestedMeta, parse::Parser, Attribute, ItemFn, LitInt, LitStr};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Options accepted by both attributes.
///
/// `#[timeout]` and `#[timeout(10)]` set only the deadline. The async form also
/// takes named options: `#[tokio_timeout_test(secs = 10, flavor = "multi_thread",
/// worker_threads = 4)]`.
struct TimeoutArgs {
    secs: u64,
    flavor: Flavor,
    worker_threads: Option<usize>,
}

#[derive(PartialEq)]
enum Flavor {
    CurrentThread,
    MultiThread,
}

impl Default for TimeoutArgs {
    fn default() -> Self {
        Self {
            secs: DEFAULT_TIMEOUT_SECS,
            flavor: Flavor::CurrentThread,
            worker_threads: None,
        }
    }
}

impl TimeoutArgs {
    fn parse(attr: TokenStream) -> syn::Result<Self> {
        let mut args = TimeoutArgs::default();
        if attr.is_empty() {
            return Ok(args);
        }

        if let Ok(lit) = syn::parse::<LitInt>(attr.clone()) {
            args.secs = positive_secs(&lit)?;
            return Ok(args);
        }

        let parser = syn::meta::parser(|meta: ParseNestedMeta| {
            if meta.path.is_ident("secs") {
                let lit: LitInt = meta.value()?.parse()?;
                args.secs = positive_secs(&lit)?;
                Ok(())
            } else if meta.path.is_ident("flavor") {
                let lit: LitStr = meta.value()?.parse()?;
                args.flavor = match lit.value().as_str() {
                    "current_thread" => Flavor::CurrentThread,
                    "multi_thread" => Flavor::MultiThread,
                    other => {
                        return Err(syn::Error::new_spanned(
                            &lit,
                            format!("unknown runtime flavor `{other}`"),
                        ))
                    }
                };
                Ok(())
            } else if meta.path.is_ident("worker_threads") {
                let lit: LitInt = meta.value()?.parse()?;
                args.worker_threads = Some(lit.base10_parse()?);
                Ok(())
            } else {
                Err(meta.error("expected `secs`, `flavor` or `worker_threads`"))
            }
        });
        parser.parse(attr)?;

        if args.worker_threads.is_some() && args.flavor != Flavor::MultiThread {
            return Err(syn::Error::new(
                proc_macro2::Span::call_site(),
                "`worker_threads` requires `flavor = \"multi_thread\"`",
            ));
        }
        Ok(args)
    }

    fn runtime_builder(&self) -> TokenStream2 {
        match self.flavor {
            Flavor::CurrentThread => quote! {
                tokio::runtime::Builder::new_current_thread()
            },
            Flavor::MultiThread => {
                let workers = self.worker_threads.unwrap_or(2);
                quote! {
                    tokio::runtime::Builder::new_multi_thread().worker_threads(#workers)
                }
            }
        }
    }
}

fn positive_secs(lit: &LitInt) -> syn::Result<u64> {
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(
            lit,
            "timeout must be greater than zero",
        ));
    }
    Ok(secs)
}

/// Runs `body` on a watchdog thread and fails the test if it has not reported
/// back within `secs`.
fn guarded_test(
    attrs: Vec<Attribute>,
    item: &ItemFn,
    secs: u64,
    body: TokenStream2,
) -> TokenStream {
    let vis = &item.vis;
    let mut sig = item.sig.clone();
    sig.asyncness = None;

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| #body));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {}s deadline", #secs)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match TimeoutArgs::parse(attr) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };
    let item = match syn::parse::<ItemFn>(item) {
        Ok(item) => item,
        Err(err) => return err.to_compile_error().into(),
    };

    if item.sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &item.sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }

    let attrs = strip_attributes(item.attrs.clone(), is_tokio_test_attribute);
    let builder = args.runtime_builder();
    let block = &item.block;
    let secs = args.secs;
    let body = quote! {{
        let runtime = #builder
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async {
            tokio::time::timeout(timeout_duration, async move #block)
                .await
                .expect("test timed out");
        });
    }};

    guarded_test(attrs, &item, secs, body)
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match TimeoutArgs::parse(attr) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };
    if args.flavor != Flavor::CurrentThread {
        return syn::Error::new(
            proc_macro2::Span::call_site(),
            "runtime options only apply to tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }
    let item = match syn::parse::<ItemFn>(item) {
        Ok(item) => item,
        Err(err) => return err.to_compile_error().into(),
    };

    if item.sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &item.sig.ident,
            "timeout attribute expects a synchronous test function; use tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }

    let attrs = strip_attributes(item.attrs.clone(), is_test_attribute);
    let block = &item.block;
    guarded_test(attrs, &item, args.secs, quote! { #block })
}

fn strip_attributes(attrs: Vec<Attribute>, drop: fn(&Attribute) -> bool) -> Vec<Attribute> {
    attrs.into_iter().filter(|attr| !drop(attr)).collect()
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}

fn is_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!((segments.next(), segments.next()), (Some(first), None) if first.ident == "test")
}
