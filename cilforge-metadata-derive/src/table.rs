use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Field};

pub fn derive(tokens: proc_macro::TokenStream) -> TokenStream {
    let DeriveInput {
        ident,
        data,
        ..
    } = syn::parse(tokens).unwrap();

    let data = match data {
        Data::Struct(data) => data,
        Data::Enum(_) => panic!("Enums are not supported"),
        Data::Union(_) => panic!("Unions are not supported"),
    };

    let table = format_ident!("{}Table", ident);
    let reads = data.fields.iter().map(|Field { ident, .. }| {
        // `IndexSizes` implements `AsRef<()>` and `AsRef<IndexSizes>`, so the right dependency
        // type is picked by inference from each field's own `FromByteStream::Deps`.
        quote! { #ident: crate::utilities::FromByteStream::read(stream, sizes.as_ref())? }
    });

    quote! {
        #[derive(Debug, Clone)]
        pub struct #table {
            row_size: usize,
            rows: Vec<#ident>,
        }

        impl #table {
            pub fn read(
                stream: &mut Cursor<&[u8]>,
                sizes: &crate::raw::indices::sizes::IndexSizes,
                len: usize,
            ) -> std::io::Result<Self> {
                let start = stream.position() as usize;

                let mut rows = Vec::with_capacity(len);
                for _ in 0..len {
                    rows.push(#ident { #(#reads),* })
                }

                let row_size = match len {
                    0 => 0,
                    _ => (stream.position() as usize - start) / len,
                };
                Ok(Self { rows, row_size })
            }

            #[inline]
            pub fn rows(&self) -> &[#ident] {
                &self.rows
            }

            #[inline]
            pub fn get(&self, index: usize) -> Option<&#ident> {
                self.rows.get(index)
            }

            #[inline]
            pub fn iter(&self) -> std::slice::Iter<'_, #ident> {
                self.rows.iter()
            }

            #[inline]
            pub fn row_size(&self) -> usize {
                self.row_size
            }
        }

        impl Table for #table {
            fn len(&self) -> usize {
                self.rows.len()
            }

            fn kind(&self) -> TableKind {
                TableKind::#ident
            }
        }

        impl std::ops::Index<usize> for #table {
            type Output = #ident;
            #[inline]
            fn index(&self, index: usize) -> &Self::Output {
                &self.rows[index]
            }
        }
    }
}
