//! KvLayout derive macro implementation.
//!
//! # Field-level attributes `#[kv(...)]`
//!
//! | Key | Example | Description |
//! |-----|---------|-------------|
//! | `key` | `"data_source/"` | Routing key of the field |
//! | `shape` | `"map"` | Shape override (`map`, `sequence`, `record`, `scalar`) |
//!
//! # Container-level attributes `#[kv(...)]`
//!
//! | Key | Example | Description |
//! |-----|---------|-------------|
//! | `crate` | `"my_app::kvconf::core"` | Path of the core crate in generated code |
//!
//! Without `crate`, the path is found from the deriving crate's manifest:
//! `kvconf::core` when it depends on the `kvconf` facade, `kvconf_core`
//! otherwise.
//!
//! # Serde attributes read
//!
//! | Level | Key | Effect |
//! |-------|-----|--------|
//! | container | `rename_all` | Field names follow the serde case convention |
//! | field | `rename` | Field name |
//! | field | `skip`, `skip_serializing` | Field omitted from the layout |
//! | field | `flatten` | Rejected |

use proc_macro_crate::{FoundCrate, crate_name};
use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::meta::ParseNestedMeta;
use syn::{Attribute, Data, DeriveInput, Fields, GenericArgument, PathArguments, Type};
use syn::{LitStr, Token, spanned::Spanned};

// ============================================================================
// Attribute structures
// ============================================================================

#[derive(Clone, Copy)]
enum ShapeKind {
    Record,
    Map,
    Sequence,
    Scalar,
}

impl ShapeKind {
    fn parse(lit: &LitStr) -> syn::Result<Self> {
        match lit.value().as_str() {
            "record" => Ok(Self::Record),
            "map" => Ok(Self::Map),
            "sequence" => Ok(Self::Sequence),
            "scalar" => Ok(Self::Scalar),
            other => Err(syn::Error::new(
                lit.span(),
                format!(
                    "unknown shape `{other}`, expected one of: record, map, sequence, scalar"
                ),
            )),
        }
    }

    fn tokens(self, krate: &TokenStream) -> TokenStream {
        match self {
            Self::Record => quote!(#krate::Shape::Record),
            Self::Map => quote!(#krate::Shape::Map),
            Self::Sequence => quote!(#krate::Shape::Sequence),
            Self::Scalar => quote!(#krate::Shape::Scalar),
        }
    }
}

#[derive(Clone, Copy)]
enum RenameRule {
    Lower,
    Upper,
    Pascal,
    Camel,
    Snake,
    ScreamingSnake,
    Kebab,
    ScreamingKebab,
}

impl RenameRule {
    fn parse(lit: &LitStr) -> syn::Result<Self> {
        match lit.value().as_str() {
            "lowercase" => Ok(Self::Lower),
            "UPPERCASE" => Ok(Self::Upper),
            "PascalCase" => Ok(Self::Pascal),
            "camelCase" => Ok(Self::Camel),
            "snake_case" => Ok(Self::Snake),
            "SCREAMING_SNAKE_CASE" => Ok(Self::ScreamingSnake),
            "kebab-case" => Ok(Self::Kebab),
            "SCREAMING-KEBAB-CASE" => Ok(Self::ScreamingKebab),
            other => Err(syn::Error::new(
                lit.span(),
                format!("unsupported rename_all rule `{other}`"),
            )),
        }
    }

    /// Applies the rule to a snake_case field identifier.
    fn apply(self, field: &str) -> String {
        match self {
            Self::Lower | Self::Snake => field.to_string(),
            Self::Upper | Self::ScreamingSnake => field.to_ascii_uppercase(),
            Self::Pascal => pascal(field),
            Self::Camel => {
                let pascal = pascal(field);
                let mut chars = pascal.chars();
                match chars.next() {
                    Some(first) => first.to_ascii_lowercase().to_string() + chars.as_str(),
                    None => pascal,
                }
            }
            Self::Kebab => field.replace('_', "-"),
            Self::ScreamingKebab => field.replace('_', "-").to_ascii_uppercase(),
        }
    }
}

fn pascal(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut capitalize = true;
    for c in field.chars() {
        if c == '_' {
            capitalize = true;
        } else if capitalize {
            out.push(c.to_ascii_uppercase());
            capitalize = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Container-level settings gathered from `#[kv]` and `#[serde]`.
#[derive(Default)]
struct ContainerAttrs {
    rename_all: Option<RenameRule>,
    krate: Option<syn::Path>,
}

impl ContainerAttrs {
    fn core_path(&self) -> TokenStream {
        match &self.krate {
            Some(path) => quote!(#path),
            None => default_core_path(),
        }
    }
}

/// Locates the core crate through the deriving crate's dependencies.
fn default_core_path() -> TokenStream {
    match crate_name("kvconf") {
        Ok(FoundCrate::Itself) => return quote!(crate::core),
        Ok(FoundCrate::Name(name)) => {
            let ident = format_ident!("{}", name);
            return quote!(::#ident::core);
        }
        Err(_) => {}
    }
    match crate_name("kvconf-core") {
        Ok(FoundCrate::Name(name)) => {
            let ident = format_ident!("{}", name);
            quote!(::#ident)
        }
        // The core crate names itself through `extern crate self`.
        _ => quote!(::kvconf_core),
    }
}

/// Per-field settings gathered from `#[kv]` and `#[serde]`.
#[derive(Default)]
struct FieldAttrs {
    key: Option<LitStr>,
    shape: Option<ShapeKind>,
    rename: Option<String>,
    skip: bool,
}

// ============================================================================
// Entry point
// ============================================================================

pub fn derive_kv_layout(input: &DeriveInput) -> syn::Result<TokenStream> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let container = parse_container_attrs(&input.attrs)?;
    let krate = container.core_path();

    let body = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(named) => {
                let mut entries = Vec::new();
                for field in &named.named {
                    let attrs = parse_field_attrs(&field.attrs)?;
                    if attrs.skip {
                        continue;
                    }
                    let Some(ident) = &field.ident else {
                        continue;
                    };
                    let ident = ident.to_string();
                    let ident = ident.strip_prefix("r#").unwrap_or(&ident);
                    let field_name = match (&attrs.rename, container.rename_all) {
                        (Some(rename), _) => rename.clone(),
                        (None, Some(rule)) => rule.apply(ident),
                        (None, None) => ident.to_string(),
                    };
                    let key = match &attrs.key {
                        Some(lit) => quote!(::core::option::Option::Some(#lit)),
                        None => quote!(::core::option::Option::None),
                    };
                    let shape = attrs.shape.unwrap_or_else(|| infer_shape(&field.ty)).tokens(&krate);
                    entries.push(quote! {
                        #krate::FieldLayout::new(#field_name, #key, #shape)
                    });
                }
                quote! {
                    #krate::Layout::record(::std::vec![#(#entries),*])
                }
            }
            Fields::Unit => quote!(#krate::Layout::scalar()),
            Fields::Unnamed(_) => {
                return Err(syn::Error::new(
                    input.span(),
                    "KvLayout does not support tuple structs",
                ));
            }
        },
        Data::Enum(_) => quote!(#krate::Layout::scalar()),
        Data::Union(_) => {
            return Err(syn::Error::new(
                input.span(),
                "KvLayout cannot be derived for unions",
            ));
        }
    };

    Ok(quote! {
        impl #impl_generics #krate::KvLayout for #name #ty_generics #where_clause {
            fn kv_layout(&self) -> #krate::Layout {
                #body
            }
        }
    })
}

// ============================================================================
// Attribute parsing
// ============================================================================

/// Consumes the value of a serde key this macro does not care about.
fn skip_meta_value(meta: &ParseNestedMeta) -> syn::Result<()> {
    if meta.input.peek(Token![=]) {
        meta.value()?.parse::<syn::Expr>()?;
    } else if meta.input.peek(syn::token::Paren) {
        meta.parse_nested_meta(|nested| skip_meta_value(&nested))?;
    }
    Ok(())
}

/// Reads `key = "..."` or `key(serialize = "...")`.
fn serialize_name(meta: &ParseNestedMeta) -> syn::Result<Option<LitStr>> {
    if meta.input.peek(Token![=]) {
        return Ok(Some(meta.value()?.parse()?));
    }
    let mut name = None;
    meta.parse_nested_meta(|nested| {
        if nested.path.is_ident("serialize") {
            name = Some(nested.value()?.parse()?);
        } else {
            skip_meta_value(&nested)?;
        }
        Ok(())
    })?;
    Ok(name)
}

fn parse_container_attrs(attrs: &[Attribute]) -> syn::Result<ContainerAttrs> {
    let mut result = ContainerAttrs::default();
    for attr in attrs {
        if attr.path().is_ident("kv") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("crate") {
                    let lit: LitStr = meta.value()?.parse()?;
                    result.krate = Some(lit.parse()?);
                    Ok(())
                } else {
                    Err(meta.error("unknown kv container attribute, expected `crate`"))
                }
            })?;
            continue;
        }
        if !attr.path().is_ident("serde") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("rename_all") {
                if let Some(lit) = serialize_name(&meta)? {
                    result.rename_all = Some(RenameRule::parse(&lit)?);
                }
            } else {
                skip_meta_value(&meta)?;
            }
            Ok(())
        })?;
    }
    Ok(result)
}

fn parse_field_attrs(attrs: &[Attribute]) -> syn::Result<FieldAttrs> {
    let mut result = FieldAttrs::default();
    for attr in attrs {
        if attr.path().is_ident("kv") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("key") {
                    let lit: LitStr = meta.value()?.parse()?;
                    if lit.value().is_empty() {
                        return Err(syn::Error::new(lit.span(), "routing key cannot be empty"));
                    }
                    result.key = Some(lit);
                } else if meta.path.is_ident("shape") {
                    let lit: LitStr = meta.value()?.parse()?;
                    result.shape = Some(ShapeKind::parse(&lit)?);
                } else {
                    return Err(meta.error("unknown kv attribute, expected `key` or `shape`"));
                }
                Ok(())
            })?;
        } else if attr.path().is_ident("serde") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("rename") {
                    if let Some(lit) = serialize_name(&meta)? {
                        result.rename = Some(lit.value());
                    }
                } else if meta.path.is_ident("skip") || meta.path.is_ident("skip_serializing") {
                    result.skip = true;
                } else if meta.path.is_ident("flatten") {
                    return Err(meta.error("KvLayout does not support #[serde(flatten)]"));
                } else {
                    skip_meta_value(&meta)?;
                }
                Ok(())
            })?;
        }
    }
    Ok(result)
}

// ============================================================================
// Shape inference
// ============================================================================

/// Returns the first type argument of a path segment, e.g. `T` in `Option<T>`.
fn first_type_arg(args: &PathArguments) -> Option<&Type> {
    match args {
        PathArguments::AngleBracketed(args) => args.args.iter().find_map(|arg| match arg {
            GenericArgument::Type(ty) => Some(ty),
            _ => None,
        }),
        _ => None,
    }
}

fn infer_shape(ty: &Type) -> ShapeKind {
    match ty {
        Type::Path(path) => {
            let Some(last) = path.path.segments.last() else {
                return ShapeKind::Record;
            };
            match last.ident.to_string().as_str() {
                "Option" | "Box" | "Arc" | "Rc" | "Cow" => first_type_arg(&last.arguments)
                    .map(infer_shape)
                    .unwrap_or(ShapeKind::Record),
                "Vec" | "VecDeque" | "LinkedList" | "HashSet" | "BTreeSet" | "IndexSet"
                | "SmallVec" => ShapeKind::Sequence,
                "HashMap" | "BTreeMap" | "IndexMap" | "Map" | "Value" => ShapeKind::Map,
                "String" | "str" | "bool" | "char" | "i8" | "i16" | "i32" | "i64" | "i128"
                | "isize" | "u8" | "u16" | "u32" | "u64" | "u128" | "usize" | "f32" | "f64"
                | "PathBuf" => ShapeKind::Scalar,
                _ => ShapeKind::Record,
            }
        }
        Type::Array(_) | Type::Slice(_) | Type::Tuple(_) => ShapeKind::Sequence,
        Type::Reference(reference) => infer_shape(&reference.elem),
        Type::Group(group) => infer_shape(&group.elem),
        Type::Paren(paren) => infer_shape(&paren.elem),
        _ => ShapeKind::Record,
    }
}
