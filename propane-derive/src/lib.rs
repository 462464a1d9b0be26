use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{parse_quote, Data, DeriveInput, Type};

/// Derives `from_repr(discriminant) -> Option<Self>` for fieldless enums
/// with explicit discriminants, matching against the enum's `#[repr]` type.
/// Used to decode opcode and address-kind bytes back into enums.
#[proc_macro_derive(FromRepr)]
pub fn derive_from_repr(input: TokenStream) -> TokenStream {
	expand_from_repr(input).into()
}

fn expand_from_repr(tokens: TokenStream) -> TokenStream2 {
	let DeriveInput { attrs, ident, generics, data, .. } = syn::parse(tokens).unwrap();

	let data = match data {
		Data::Enum(data) => data,
		Data::Union(_) => panic!("Unions are not supported"),
		Data::Struct(_) => panic!("Structs are not supported"),
	};

	if !generics.params.is_empty() {
		panic!("Generics are not supported");
	}

	let mut repr: Type = parse_quote!(usize);
	for attr in attrs.iter() {
		if attr.path().is_ident("repr") {
			repr = attr.parse_args::<Type>().unwrap();
		}
	}

	let mut constants = Vec::with_capacity(data.variants.len());
	let mut cases = Vec::with_capacity(data.variants.len());
	for (i, variant) in data.variants.iter().enumerate() {
		let Some((_, discriminant)) = &variant.discriminant else {
			panic!("Explicit discriminant required for `{}`", variant.ident);
		};
		let variant_name = &variant.ident;
		let constant = format_ident!("DISCRIMINANT_{i}");
		constants.push(quote! {
			const #constant: #repr = #discriminant;
		});
		cases.push(quote! {
			#constant => Some(Self::#variant_name),
		});
	}

	quote! {
		impl #ident {
			pub(crate) fn from_repr(discriminant: #repr) -> Option<Self> {
				#(#constants)*
				match discriminant {
					#(#cases)*
					_ => None,
				}
			}
		}
	}
}
