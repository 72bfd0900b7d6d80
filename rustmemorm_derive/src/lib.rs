use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{
    Data, DeriveInput, Fields, GenericArgument, Ident, LitBool, LitInt, LitStr, PathArguments, Type,
    parse_macro_input, spanned::Spanned,
};

/// Implements `rustmemorm::Entity`: the mapping table entry and row hydration.
///
/// ```ignore
/// #[derive(Entity)]
/// #[entity(table = "orders")]
/// struct Order {
///     #[id(strategy = "sequence", sequence = "order_seq", allocation_size = 20)]
///     id: i64,
///     total: f64,
///     #[many_to_one]
///     customer: Ref<Customer>,
/// }
/// ```
#[proc_macro_derive(
    Entity,
    attributes(entity, id, column, version, many_to_one, one_to_many, transient)
)]
pub fn derive_entity(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand_entity(input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

#[derive(Default)]
struct EntityOptions {
    table: Option<String>,
    name: Option<String>,
}

enum Strategy {
    Assigned,
    Identity,
    Uuid,
    Sequence {
        name: Option<String>,
        allocation_size: Option<u32>,
    },
}

struct IdOptions {
    strategy: Strategy,
    column: Option<String>,
}

#[derive(Default)]
struct ColumnOptions {
    name: Option<String>,
    updatable: Option<bool>,
    insertable: Option<bool>,
}

enum FieldRole {
    Id(IdOptions),
    Basic(ColumnOptions),
    Version(ColumnOptions),
    ManyToOne { column: Option<String> },
    OneToMany { mapped_by: String, element: Type },
    Transient,
}

struct EntityField {
    ident: Ident,
    ty: Type,
    role: FieldRole,
}

fn expand_entity(input: DeriveInput) -> syn::Result<TokenStream2> {
    let struct_name = input.ident;

    if !input.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            input.generics,
            "Entity cannot be derived for generic structs",
        ));
    }

    let options = parse_entity_options(&input.attrs)?;

    let Data::Struct(data_struct) = input.data else {
        return Err(syn::Error::new(
            struct_name.span(),
            "Entity can only be derived for structs",
        ));
    };
    let Fields::Named(named_fields) = data_struct.fields else {
        return Err(syn::Error::new(
            struct_name.span(),
            "Entity requires named fields",
        ));
    };

    let mut fields = Vec::new();
    for field in named_fields.named {
        let ident = field
            .ident
            .clone()
            .ok_or_else(|| syn::Error::new(field.span(), "Entity requires named fields"))?;
        let role = parse_field_role(&field.attrs, &field.ty)?;
        fields.push(EntityField {
            ident,
            ty: field.ty,
            role,
        });
    }

    let ids: Vec<&EntityField> = fields
        .iter()
        .filter(|f| matches!(f.role, FieldRole::Id(_)))
        .collect();
    let id_field = match ids.as_slice() {
        [id] => *id,
        [] => {
            return Err(syn::Error::new(
                struct_name.span(),
                "Entity requires exactly one #[id] field",
            ));
        }
        [_, second, ..] => {
            return Err(syn::Error::new(
                second.ident.span(),
                "Entity allows only one #[id] field",
            ));
        }
    };

    let entity_name = options.name.unwrap_or_else(|| struct_name.to_string());
    let table_name = options
        .table
        .unwrap_or_else(|| default_table_name(&struct_name.to_string()));

    let id_mapping = expand_id_mapping(&struct_name, id_field, &table_name)?;
    let mut accessors = vec![id_mapping.accessors];
    let mut field_mappings = Vec::new();
    let mut hydrate_fields = Vec::new();

    for field in &fields {
        let ident = &field.ident;
        let name = ident.to_string();
        let ty = &field.ty;
        let getter = format_ident!("__{}_get", ident);
        let setter = format_ident!("__{}_set", ident);

        match &field.role {
            FieldRole::Id(_) => {
                hydrate_fields.push(quote! { #ident: hydrator.id()? });
            }
            FieldRole::Basic(column) => {
                accessors.push(quote! {
                    fn #getter(entity: &#struct_name) -> ::rustmemorm::Value {
                        ::rustmemorm::FieldValue::to_value(&entity.#ident)
                    }
                });
                let modifiers = column_modifiers(column);
                field_mappings.push(quote! {
                    ::rustmemorm::FieldMapping::basic::<#struct_name>(#name, #getter) #modifiers
                });
                hydrate_fields.push(quote! { #ident: hydrator.value(#name)? });
            }
            FieldRole::Version(column) => {
                accessors.push(quote! {
                    fn #getter(entity: &#struct_name) -> ::rustmemorm::Value {
                        ::rustmemorm::FieldValue::to_value(&entity.#ident)
                    }
                    fn #setter(entity: &mut #struct_name, value: ::rustmemorm::Value) -> ::rustmemorm::Result<()> {
                        entity.#ident = ::rustmemorm::FieldValue::from_value(value)?;
                        Ok(())
                    }
                });
                let modifiers = column_modifiers(column);
                field_mappings.push(quote! {
                    ::rustmemorm::FieldMapping::version::<#struct_name>(#name, #getter, #setter) #modifiers
                });
                hydrate_fields.push(quote! { #ident: hydrator.value(#name)? });
            }
            FieldRole::ManyToOne { column } => {
                accessors.push(quote! {
                    fn #getter(entity: &#struct_name) -> &#ty {
                        &entity.#ident
                    }
                });
                let column = column.as_ref().map(|c| quote! { .column(#c) });
                field_mappings.push(quote! {
                    ::rustmemorm::FieldMapping::many_to_one::<#struct_name, #ty>(#name, #getter) #column
                });
                hydrate_fields.push(quote! { #ident: hydrator.reference(#name)? });
            }
            FieldRole::OneToMany { mapped_by, element } => {
                field_mappings.push(quote! {
                    ::rustmemorm::FieldMapping::one_to_many::<#element>(#name, #mapped_by)
                });
                hydrate_fields.push(quote! { #ident: hydrator.collection(#name)? });
            }
            FieldRole::Transient => {
                hydrate_fields.push(quote! { #ident: ::std::default::Default::default() });
            }
        }
    }

    let id_expr = id_mapping.expr;
    Ok(quote! {
        impl ::rustmemorm::Entity for #struct_name {
            fn mapping() -> &'static ::rustmemorm::EntityMapping {
                static MAPPING: ::std::sync::OnceLock<::rustmemorm::EntityMapping> =
                    ::std::sync::OnceLock::new();
                MAPPING.get_or_init(|| {
                    #(#accessors)*
                    ::rustmemorm::EntityMapping::builder::<#struct_name>(#entity_name, #table_name, #id_expr)
                        #(.field(#field_mappings))*
                        .build()
                })
            }

            fn hydrate(hydrator: &mut ::rustmemorm::Hydrator<'_>) -> ::rustmemorm::Result<Self> {
                Ok(Self {
                    #(#hydrate_fields,)*
                })
            }
        }
    })
}

struct IdExpansion {
    accessors: TokenStream2,
    expr: TokenStream2,
}

fn expand_id_mapping(struct_name: &Ident, field: &EntityField, table: &str) -> syn::Result<IdExpansion> {
    let FieldRole::Id(options) = &field.role else {
        return Err(syn::Error::new(field.ident.span(), "expected the #[id] field"));
    };
    let ident = &field.ident;
    let name = ident.to_string();
    let getter = format_ident!("__{}_get", ident);
    let setter = format_ident!("__{}_set", ident);

    let strategy = match &options.strategy {
        Strategy::Assigned => quote! { ::rustmemorm::GenerationStrategy::Assigned },
        Strategy::Identity => quote! { ::rustmemorm::GenerationStrategy::Identity },
        Strategy::Uuid => quote! { ::rustmemorm::GenerationStrategy::Uuid },
        Strategy::Sequence {
            name: sequence,
            allocation_size,
        } => {
            let sequence = sequence.clone().unwrap_or_else(|| format!("{}_seq", table));
            let allocation_size = match allocation_size {
                Some(size) => quote! { ::std::option::Option::Some(#size) },
                None => quote! { ::std::option::Option::None },
            };
            quote! {
                ::rustmemorm::GenerationStrategy::Sequence {
                    name: ::std::string::String::from(#sequence),
                    allocation_size: #allocation_size,
                }
            }
        }
    };
    let column = options.column.as_ref().map(|c| quote! { .column(#c) });

    Ok(IdExpansion {
        accessors: quote! {
            fn #getter(entity: &#struct_name) -> ::rustmemorm::Value {
                ::rustmemorm::FieldValue::to_value(&entity.#ident)
            }
            fn #setter(entity: &mut #struct_name, value: ::rustmemorm::Value) -> ::rustmemorm::Result<()> {
                entity.#ident = ::rustmemorm::FieldValue::from_value(value)?;
                Ok(())
            }
        },
        expr: quote! {
            ::rustmemorm::IdMapping::new::<#struct_name>(#name, #strategy, #getter, #setter) #column
        },
    })
}

fn column_modifiers(options: &ColumnOptions) -> TokenStream2 {
    let name = options.name.as_ref().map(|c| quote! { .column(#c) });
    let updatable = options.updatable.map(|u| quote! { .updatable(#u) });
    let insertable = options.insertable.map(|i| quote! { .insertable(#i) });
    quote! { #name #updatable #insertable }
}

fn default_table_name(struct_name: &str) -> String {
    let mut table = String::with_capacity(struct_name.len() + 4);
    for (i, c) in struct_name.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                table.push('_');
            }
            table.extend(c.to_lowercase());
        } else {
            table.push(c);
        }
    }
    table.push('s');
    table
}

fn parse_entity_options(attrs: &[syn::Attribute]) -> syn::Result<EntityOptions> {
    let mut options = EntityOptions::default();
    for attr in attrs {
        if !attr.path().is_ident("entity") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("table") {
                let lit: LitStr = meta.value()?.parse()?;
                options.table = Some(lit.value());
                return Ok(());
            }
            if meta.path.is_ident("name") {
                let lit: LitStr = meta.value()?.parse()?;
                options.name = Some(lit.value());
                return Ok(());
            }
            Err(meta.error(
                "Unsupported entity attribute. Supported: table = \"...\", name = \"...\"",
            ))
        })?;
    }
    Ok(options)
}

fn parse_id_options(attr: &syn::Attribute) -> syn::Result<IdOptions> {
    let mut strategy = None;
    let mut sequence = None;
    let mut allocation_size = None;
    let mut column = None;

    if let syn::Meta::List(_) = &attr.meta {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("strategy") {
                let lit: LitStr = meta.value()?.parse()?;
                strategy = Some(lit);
                return Ok(());
            }
            if meta.path.is_ident("sequence") {
                let lit: LitStr = meta.value()?.parse()?;
                sequence = Some(lit.value());
                return Ok(());
            }
            if meta.path.is_ident("allocation_size") {
                let lit: LitInt = meta.value()?.parse()?;
                allocation_size = Some(lit.base10_parse::<u32>()?);
                return Ok(());
            }
            if meta.path.is_ident("column") {
                let lit: LitStr = meta.value()?.parse()?;
                column = Some(lit.value());
                return Ok(());
            }
            Err(meta.error(
                "Unsupported id attribute. Supported: strategy, sequence, allocation_size, column",
            ))
        })?;
    }

    let is_sequence = sequence.is_some() || allocation_size.is_some();
    let strategy = match strategy.as_ref().map(|lit| (lit.value(), lit.span())) {
        None if is_sequence => Strategy::Sequence {
            name: sequence,
            allocation_size,
        },
        None => Strategy::Assigned,
        Some((value, span)) => match value.as_str() {
            "sequence" => Strategy::Sequence {
                name: sequence,
                allocation_size,
            },
            _ if is_sequence => {
                return Err(syn::Error::new(
                    span,
                    "sequence and allocation_size require strategy = \"sequence\"",
                ));
            }
            "assigned" => Strategy::Assigned,
            "identity" => Strategy::Identity,
            "uuid" => Strategy::Uuid,
            _ => {
                return Err(syn::Error::new(
                    span,
                    "Unknown strategy. Supported: assigned, sequence, identity, uuid",
                ));
            }
        },
    };

    Ok(IdOptions { strategy, column })
}

fn parse_column_options(attr: Option<&syn::Attribute>) -> syn::Result<ColumnOptions> {
    let mut options = ColumnOptions::default();
    let Some(attr) = attr else {
        return Ok(options);
    };
    attr.parse_nested_meta(|meta| {
        if meta.path.is_ident("name") {
            let lit: LitStr = meta.value()?.parse()?;
            options.name = Some(lit.value());
            return Ok(());
        }
        if meta.path.is_ident("updatable") {
            let lit: LitBool = meta.value()?.parse()?;
            options.updatable = Some(lit.value());
            return Ok(());
        }
        if meta.path.is_ident("insertable") {
            let lit: LitBool = meta.value()?.parse()?;
            options.insertable = Some(lit.value());
            return Ok(());
        }
        Err(meta.error(
            "Unsupported column attribute. Supported: name = \"...\", updatable = bool, insertable = bool",
        ))
    })?;
    Ok(options)
}

fn parse_field_role(attrs: &[syn::Attribute], ty: &Type) -> syn::Result<FieldRole> {
    let find = |name: &str| attrs.iter().find(|attr| attr.path().is_ident(name));
    let markers = ["id", "version", "many_to_one", "one_to_many", "transient"];
    let present: Vec<&syn::Attribute> = markers.iter().filter_map(|m| find(m)).collect();
    if let [_, second, ..] = present.as_slice() {
        return Err(syn::Error::new(
            second.span(),
            "a field takes only one of #[id], #[version], #[many_to_one], #[one_to_many], #[transient]",
        ));
    }
    let column = find("column");

    if let Some(attr) = find("id") {
        return Ok(FieldRole::Id(parse_id_options(attr)?));
    }
    if find("version").is_some() {
        return Ok(FieldRole::Version(parse_column_options(column)?));
    }
    if let Some(attr) = find("many_to_one") {
        let mut join_column = None;
        if let syn::Meta::List(_) = &attr.meta {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("column") {
                    let lit: LitStr = meta.value()?.parse()?;
                    join_column = Some(lit.value());
                    return Ok(());
                }
                Err(meta.error("Unsupported many_to_one attribute. Supported: column = \"...\""))
            })?;
        }
        return Ok(FieldRole::ManyToOne {
            column: join_column,
        });
    }
    if let Some(attr) = find("one_to_many") {
        let mut mapped_by = None;
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("mapped_by") {
                let lit: LitStr = meta.value()?.parse()?;
                mapped_by = Some(lit.value());
                return Ok(());
            }
            Err(meta.error("Unsupported one_to_many attribute. Supported: mapped_by = \"...\""))
        })?;
        let mapped_by = mapped_by.ok_or_else(|| {
            syn::Error::new(attr.span(), "#[one_to_many] requires mapped_by = \"...\"")
        })?;
        let element = collection_element(ty).ok_or_else(|| {
            syn::Error::new(ty.span(), "#[one_to_many] fields must be LazyList<T>")
        })?;
        return Ok(FieldRole::OneToMany { mapped_by, element });
    }
    if find("transient").is_some() {
        return Ok(FieldRole::Transient);
    }
    Ok(FieldRole::Basic(parse_column_options(column)?))
}

/// `T` of a `LazyList<T>` field type.
fn collection_element(ty: &Type) -> Option<Type> {
    let Type::Path(path) = ty else {
        return None;
    };
    let segment = path.path.segments.last()?;
    if segment.ident != "LazyList" {
        return None;
    }
    let PathArguments::AngleBracketed(arguments) = &segment.arguments else {
        return None;
    };
    arguments.args.iter().find_map(|arg| match arg {
        GenericArgument::Type(element) => Some(element.clone()),
        _ => None,
    })
}
