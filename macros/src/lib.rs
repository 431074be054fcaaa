use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::parse::{Parse, ParseStream};
use syn::{Ident, ItemFn, LitStr, Token, parse_macro_input};

/// Marks a function as the implementation of a PE import.
///
/// This attribute macro:
/// 1. Gives the function the Windows x64 calling convention
/// 2. Registers `(module, name, address)` in `peloader::symbols::IMPORT_PROVIDERS`
///
/// The import name defaults to the function name and can be overridden with
/// `name = "..."`.
///
/// # Example
///
/// ```ignore
/// #[pe_import("msvcrt.dll")]
/// unsafe fn strlen(s: *const libc::c_char) -> usize {
///     unsafe { libc::strlen(s) }
/// }
/// ```
///
/// Expands to:
///
/// ```ignore
/// unsafe extern "win64" fn strlen(s: *const libc::c_char) -> usize {
///     unsafe { libc::strlen(s) }
/// }
///
/// #[::peloader::linkme::distributed_slice(::peloader::symbols::IMPORT_PROVIDERS)]
/// #[linkme(crate = ::peloader::linkme)]
/// static _PE_IMPORT_STRLEN: ::peloader::symbols::ImportProvider = ...;
/// ```
#[proc_macro_attribute]
pub fn pe_import(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as ImportArgs);
    let input = parse_macro_input!(item as ItemFn);

    match expand(args, input) {
        Ok(expanded) => TokenStream::from(expanded),
        Err(e) => e.to_compile_error().into(),
    }
}

fn expand(args: ImportArgs, input: ItemFn) -> syn::Result<proc_macro2::TokenStream> {
    let sig = &input.sig;
    if let Some(abi) = &sig.abi {
        return Err(syn::Error::new_spanned(abi, "#[pe_import] sets the calling convention itself"));
    }
    // The provider table needs a single concrete address.
    if !sig.generics.params.is_empty() || sig.generics.where_clause.is_some() {
        return Err(syn::Error::new_spanned(&sig.generics, "#[pe_import] functions cannot be generic"));
    }

    let vis = &input.vis;
    let block = &input.block;
    let attrs = &input.attrs;

    let function = &sig.ident;
    let unsafety = &sig.unsafety;
    let inputs = &sig.inputs;
    let output = &sig.output;

    let module = &args.module;
    let name = args
        .name
        .unwrap_or_else(|| LitStr::new(&function.to_string(), function.span()));
    let static_name = format_ident!("_PE_IMPORT_{}", function.to_string().to_uppercase());

    Ok(quote! {
        #(#attrs)*
        #vis #unsafety extern "win64" fn #function(#inputs) #output #block

        #[::peloader::linkme::distributed_slice(::peloader::symbols::IMPORT_PROVIDERS)]
        #[linkme(crate = ::peloader::linkme)]
        static #static_name: ::peloader::symbols::ImportProvider = ::peloader::symbols::ImportProvider {
            module: #module,
            name: #name,
            address: ::peloader::symbols::FnPtr(#function as *const ()),
        };
    })
}

/// `"module.dll"` optionally followed by `, name = "Symbol"`.
struct ImportArgs {
    module: LitStr,
    name: Option<LitStr>,
}

impl Parse for ImportArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let module: LitStr = input.parse()?;
        let mut name = None;
        if input.parse::<Option<Token![,]>>()?.is_some() && !input.is_empty() {
            let key: Ident = input.parse()?;
            if key != "name" {
                return Err(syn::Error::new(key.span(), "expected `name = \"...\"`"));
            }
            input.parse::<Token![=]>()?;
            name = Some(input.parse()?);
            input.parse::<Option<Token![,]>>()?;
        }
        Ok(Self { module, name })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syn::parse_quote;

    fn args() -> ImportArgs {
        parse_quote!("msvcrt.dll")
    }

    fn message(result: syn::Result<proc_macro2::TokenStream>) -> String {
        match result {
            Err(e) => e.to_string(),
            Ok(tokens) => panic!("expected an error, got {}", tokens),
        }
    }

    #[test]
    fn plain_function_is_registered() {
        let input: ItemFn = parse_quote! {
            unsafe fn strlen(s: *const u8) -> usize { 0 }
        };
        let expanded = expand(args(), input).unwrap().to_string();
        assert!(expanded.contains("extern \"win64\" fn strlen"));
        assert!(expanded.contains("_PE_IMPORT_STRLEN"));
        assert!(expanded.contains("\"strlen\""));
    }

    #[test]
    fn explicit_name_overrides_the_function_name() {
        let args: ImportArgs = parse_quote!("kernel32.dll", name = "GetTickCount");
        let input: ItemFn = parse_quote! {
            fn ticks() -> u32 { 0 }
        };
        let expanded = expand(args, input).unwrap().to_string();
        assert!(expanded.contains("\"GetTickCount\""));
        assert!(expanded.contains("\"kernel32.dll\""));
    }

    #[test]
    fn generic_functions_are_rejected() {
        let input: ItemFn = parse_quote! {
            fn first<T: Copy>(value: T) -> T { value }
        };
        assert_eq!(message(expand(args(), input)), "#[pe_import] functions cannot be generic");
    }

    #[test]
    fn where_clauses_are_rejected() {
        let input: ItemFn = parse_quote! {
            fn first(value: u32) -> u32 where u32: Copy { value }
        };
        assert_eq!(message(expand(args(), input)), "#[pe_import] functions cannot be generic");
    }

    #[test]
    fn explicit_abi_is_rejected() {
        let input: ItemFn = parse_quote! {
            extern "C" fn ticks() -> u32 { 0 }
        };
        assert_eq!(message(expand(args(), input)), "#[pe_import] sets the calling convention itself");
    }
}
