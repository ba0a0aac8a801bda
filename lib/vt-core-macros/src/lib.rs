extern crate proc_macro;

use syn;

/// Auto-registers a unit-struct functor as a global handler: at
/// static-init time (via `ctor`) it registers itself in `vt_core`'s
/// handler table and remembers the resulting id, so call sites can name
/// the handler as `MyHandler::handler_id()` instead of threading a raw
/// `HandlerT` around. The struct must separately implement
/// `vt_core::handler::Functor`.
#[proc_macro_derive(Handler)]
pub fn derive_handler(item: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let ast: syn::DeriveInput = syn::parse(item).unwrap();
    derive_core(&ast.ident.to_string())
}

fn derive_core(struct_name: &str) -> proc_macro::TokenStream {
    let static_mod = format!("__{}_handler_mod", struct_name.to_lowercase());
    let static_id = format!("__{}_HANDLER_ID", struct_name.to_uppercase());

    let tokens = format!(
        r###"
        mod {static_mod} {{
            pub(crate) static {static_id}: ::std::sync::atomic::AtomicU64 =
                ::std::sync::atomic::AtomicU64::new(::std::u64::MAX);
        }}

        #[::vt_core::ctor::ctor]
        fn {static_mod}_register() {{
            let handler = ::vt_core::handler::register_functor::<{struct_name}>();
            {static_mod}::{static_id}.store(handler, ::std::sync::atomic::Ordering::SeqCst);
        }}

        impl ::vt_core::handler::AutoHandler for {struct_name} {{
            #[inline]
            fn handler_id() -> ::vt_core::handler::HandlerT {{
                {static_mod}::{static_id}.load(::std::sync::atomic::Ordering::SeqCst)
            }}
        }}
        "###,
        static_mod = static_mod,
        static_id = static_id,
        struct_name = struct_name,
    );

    tokens.parse().unwrap()
}
