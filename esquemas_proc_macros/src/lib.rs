use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, DeriveInput};

/// Derives `active_filters()` for query-string filter structs.
///
/// Every `Option<_>` field holding a value whose textual form is not blank
/// counts as an active filter; other fields are ignored.
#[proc_macro_derive(ActiveFilters)]
pub fn active_filters(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    let struct_name = input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let fields = if let syn::Data::Struct(syn::DataStruct {
                                              fields: syn::Fields::Named(ref fields),
                                              ..
                                          }) = input.data {
        fields
    } else {
        panic!("ActiveFilters supports only structs with named fields");
    };

    let checks = fields.named.iter().filter_map(|field| {
        let field_name = field.ident.as_ref()?;
        let syn::Type::Path(type_path) = &field.ty else {
            return None;
        };
        if type_path.path.segments.last()?.ident != "Option" {
            return None;
        }
        Some(quote! {
            if let Some(value) = &self.#field_name {
                if !::std::string::ToString::to_string(value).trim().is_empty() {
                    filters.push(stringify!(#field_name));
                }
            }
        })
    });

    let expanded = quote! {
        impl #impl_generics #struct_name #ty_generics #where_clause {
            pub fn active_filters(&self) -> Vec<&'static str> {
                let mut filters = Vec::new();
                #(#checks)*
                filters
            }
            pub fn has_active_filters(&self) -> bool {
                !self.active_filters().is_empty()
            }
        }
    };

    TokenStream::from(expanded)
}
