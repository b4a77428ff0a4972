//! Shared fixture: a synthetic process image with a module, globals and a
//! glibc-shaped heap, plus the descriptor catalogs describing it.

use coregraph_analysis::{AnalysisConfig, CoreAnalyzer, RootReference};
use coregraph_descriptors::{
    BaseClass, BuildId, DescriptorRegistry, FunctionDescriptor, MemberDescriptor, ModuleCatalog,
    ParameterDescriptor, StructDescriptor, TemplateArg, TemplateArgValue, TypeDescriptor,
    VariableDescriptor,
};
use coregraph_image::{
    MappedModule, MemoryImage, MemoryRegion, ModuleMap, Permissions, Symbol, SymbolKind,
    SymbolTable,
};
use std::sync::Once;

static INIT: Once = Once::new();

pub fn init() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

pub const MODULE_BASE: u64 = 0x400000;
pub const VTABLE_BASE_SYM: u64 = 0x404000; // _ZTV4Base
pub const VTABLE_DERIVED_SYM: u64 = 0x404100; // _ZTV7Derived
pub const GLOBALS: u64 = 0x600000;
pub const HEAP: u64 = 0x700000;
pub const HEAP_END: u64 = 0x700200;

// User-data bases of the heap chunks laid out in `heap_bytes`.
pub const DERIVED_OBJ: u64 = HEAP + 0x10;
pub const VEC_ELEMS: u64 = HEAP + 0x40;
pub const BOX_PAYLOAD: u64 = HEAP + 0x70;
pub const ARRAY_ALLOC: u64 = HEAP + 0xa0;
pub const ARRAY_PAST_END: u64 = HEAP + 0xc0;
pub const LEAKED_ALLOC: u64 = HEAP + 0xd0;
pub const EXTRA_LEAK_ALLOC: u64 = HEAP + 0x110;

fn ty_long() -> TypeDescriptor {
    TypeDescriptor::signed_int("long", 8)
}

fn ptr_long() -> TypeDescriptor {
    TypeDescriptor::pointer_to(ty_long())
}

fn member(name: &str, ty: TypeDescriptor, offset: u64) -> MemberDescriptor {
    MemberDescriptor {
        name: name.to_string(),
        ty,
        offset,
        bit_offset: None,
        bit_size: None,
    }
}

fn method(
    display: &str,
    receiver_type: &str,
    addr: u64,
    bytes: &[u8],
    return_type: Option<TypeDescriptor>,
) -> FunctionDescriptor {
    let this = ParameterDescriptor {
        name: Some("this".to_string()),
        ty: TypeDescriptor::pointer_to(TypeDescriptor::Named {
            name: receiver_type.to_string(),
        }),
        artificial: true,
    };
    FunctionDescriptor {
        linkage_name: format!("_Z_{}", display.replace([':', '(', ')', '*', ' '], "_")),
        display_name: display.to_string(),
        low_address: addr,
        high_address: addr + bytes.len() as u64,
        bytes: bytes.to_vec(),
        parameters: vec![this],
        return_type,
        template_args: Vec::new(),
    }
}

/// Machine code bodies shared by the fixture's accessor methods.
pub mod code {
    /// mov rax, [rdi]; ret
    pub const LOAD_0: &[u8] = &[0x48, 0x8b, 0x07, 0xc3];
    /// mov rax, [rdi+8]; ret
    pub const LOAD_8: &[u8] = &[0x48, 0x8b, 0x47, 0x08, 0xc3];
    /// cmp qword [rdi], 0; setne al; movzx eax, al; ret
    pub const NONNULL: &[u8] = &[
        0x48, 0x83, 0x3f, 0x00, 0x0f, 0x95, 0xc0, 0x0f, 0xb6, 0xc0, 0xc3,
    ];
    /// syscall; ret — outside the lifter's whitelist
    pub const UNSUPPORTED: &[u8] = &[0x0f, 0x05, 0xc3];

    /// cmp dword [rdi], tag; jne null; lea rax, [rdi+8]; ret; null: xor eax, eax; ret
    pub fn get_if(tag: u8) -> Vec<u8> {
        vec![
            0x83, 0x3f, tag, 0x75, 0x05, 0x48, 0x8d, 0x47, 0x08, 0xc3, 0x31, 0xc0, 0xc3,
        ]
    }
}

fn catalog() -> ModuleCatalog {
    let mut c = ModuleCatalog::new(BuildId::new("app"));

    c.add_type(ty_long());
    c.add_type(TypeDescriptor::Base {
        name: "double".to_string(),
        size: 8,
        encoding: gimli_float(),
    });
    c.add_type(TypeDescriptor::Struct(StructDescriptor {
        name: "Base".to_string(),
        size: 8,
        has_vtable: true,
        ..Default::default()
    }));
    c.add_type(TypeDescriptor::Struct(StructDescriptor {
        name: "Derived".to_string(),
        size: 16,
        members: vec![member("x", ty_long(), 8)],
        base_classes: vec![BaseClass {
            name: "Base".to_string(),
            offset: 0,
        }],
        has_vtable: true,
        ..Default::default()
    }));
    c.add_type(TypeDescriptor::Struct(StructDescriptor {
        name: "intvec".to_string(),
        size: 16,
        members: vec![member("first", ptr_long(), 0), member("last", ptr_long(), 8)],
        ..Default::default()
    }));
    c.add_type(TypeDescriptor::Struct(StructDescriptor {
        name: "box_long".to_string(),
        size: 8,
        members: vec![member("ptr", ptr_long(), 0)],
        ..Default::default()
    }));
    c.add_type(TypeDescriptor::Struct(StructDescriptor {
        name: "variant".to_string(),
        size: 16,
        members: vec![member("tag", ty_long(), 0), member("value", ty_long(), 8)],
        ..Default::default()
    }));
    c.add_type(TypeDescriptor::Struct(StructDescriptor {
        name: "blob".to_string(),
        size: 16,
        members: vec![member("first", ptr_long(), 0), member("last", ptr_long(), 8)],
        ..Default::default()
    }));

    c.add_function(method(
        "intvec::begin()",
        "intvec",
        0x401000,
        code::LOAD_0,
        Some(ptr_long()),
    ));
    c.add_function(method(
        "intvec::end()",
        "intvec",
        0x401010,
        code::LOAD_8,
        Some(ptr_long()),
    ));
    c.add_function(method(
        "box_long::get()",
        "box_long",
        0x401020,
        code::LOAD_0,
        Some(ptr_long()),
    ));
    c.add_function(method(
        "box_long::operator*()",
        "box_long",
        0x401030,
        code::LOAD_0,
        Some(TypeDescriptor::reference_to(ty_long())),
    ));
    c.add_function(method(
        "box_long::operator bool()",
        "box_long",
        0x401040,
        code::NONNULL,
        Some(TypeDescriptor::boolean()),
    ));

    // Tagged-union accessors: free functions with a selector template arg.
    for (addr, tag, alt_ty) in [
        (0x401050u64, 1u8, ptr_long()),
        (
            0x401060,
            2,
            TypeDescriptor::pointer_to(TypeDescriptor::Base {
                name: "double".to_string(),
                size: 8,
                encoding: gimli_float(),
            }),
        ),
    ] {
        let bytes = code::get_if(tag);
        c.add_function(FunctionDescriptor {
            linkage_name: format!("_Z6get_ifILm{tag}EE"),
            display_name: format!("get_if<{tag}ul, variant>(variant*)"),
            low_address: addr,
            high_address: addr + bytes.len() as u64,
            bytes,
            parameters: vec![ParameterDescriptor {
                name: Some("v".to_string()),
                ty: TypeDescriptor::pointer_to(TypeDescriptor::Named {
                    name: "variant".to_string(),
                }),
                artificial: false,
            }],
            return_type: Some(alt_ty),
            template_args: vec![TemplateArg {
                name: Some("I".to_string()),
                value: TemplateArgValue::Integral(tag as i64),
                is_defaulted: false,
            }],
        });
    }

    // blob's begin is compiled to something the lifter refuses.
    c.add_function(method(
        "blob::begin()",
        "blob",
        0x401070,
        code::UNSUPPORTED,
        Some(ptr_long()),
    ));
    c.add_function(method(
        "blob::end()",
        "blob",
        0x401080,
        code::LOAD_8,
        Some(ptr_long()),
    ));

    // Globals; link addresses double as runtime addresses (bias 0).
    c.add_variable(VariableDescriptor::global(
        "g_base",
        TypeDescriptor::pointer_to(TypeDescriptor::Named {
            name: "Base".to_string(),
        }),
        GLOBALS,
    ));
    c.add_variable(VariableDescriptor::global(
        "g_vec",
        TypeDescriptor::Named {
            name: "intvec".to_string(),
        },
        GLOBALS + 0x08,
    ));
    c.add_variable(VariableDescriptor::global(
        "g_sp",
        TypeDescriptor::Named {
            name: "box_long".to_string(),
        },
        GLOBALS + 0x18,
    ));
    c.add_variable(VariableDescriptor::global(
        "g_past",
        ptr_long(),
        GLOBALS + 0x20,
    ));
    c.add_variable(VariableDescriptor::global(
        "g_var",
        TypeDescriptor::Named {
            name: "variant".to_string(),
        },
        GLOBALS + 0x28,
    ));
    c.add_variable(VariableDescriptor::global(
        "g_blob",
        TypeDescriptor::Named {
            name: "blob".to_string(),
        },
        GLOBALS + 0x38,
    ));
    c.add_variable(VariableDescriptor::global(
        "g_dangle",
        ptr_long(),
        GLOBALS + 0x48,
    ));
    c.add_variable(VariableDescriptor::global(
        "g_uaf",
        ptr_long(),
        GLOBALS + 0x50,
    ));

    c
}

fn gimli_float() -> gimli::DwAte {
    gimli::DW_ATE_float
}

fn put_u64(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn globals_bytes() -> Vec<u8> {
    let mut g = vec![0u8; 0x60];
    put_u64(&mut g, 0x00, DERIVED_OBJ); // g_base
    put_u64(&mut g, 0x08, VEC_ELEMS); // g_vec.first
    put_u64(&mut g, 0x10, VEC_ELEMS + 24); // g_vec.last (3 elements)
    put_u64(&mut g, 0x18, BOX_PAYLOAD); // g_sp.ptr
    put_u64(&mut g, 0x20, ARRAY_PAST_END); // g_past
    put_u64(&mut g, 0x28, 1); // g_var.tag
    put_u64(&mut g, 0x30, 0x2a); // g_var.value
    // g_blob stays zeroed (empty container)
    put_u64(&mut g, 0x48, 0xdead0000); // g_dangle -> unmapped
    put_u64(&mut g, 0x50, HEAP + 0x120); // g_uaf -> inside the free top chunk
    g
}

fn heap_bytes(extra_leak: bool) -> Vec<u8> {
    let mut h = vec![0u8; (HEAP_END - HEAP) as usize];
    let size_word = |off: usize, size: u64| (off + 8, size | 1);

    // Chunk layout (chunk base offsets): 0x00, 0x30, 0x60, 0x90, 0xc0,
    // then either top@0x100 or (leak@0x100, top@0x130).
    for (off, size) in [
        size_word(0x00, 0x30),
        size_word(0x30, 0x30),
        size_word(0x60, 0x30),
        size_word(0x90, 0x30),
        size_word(0xc0, 0x40),
    ] {
        put_u64(&mut h, off, size);
    }
    if extra_leak {
        put_u64(&mut h, 0x108, 0x30 | 1);
        put_u64(&mut h, 0x138, 0xd0 | 1);
    } else {
        put_u64(&mut h, 0x108, 0x100 | 1);
    }

    // Derived object in chunk 0: vptr = Derived's primary address point.
    put_u64(&mut h, 0x10, VTABLE_DERIVED_SYM + 16);
    put_u64(&mut h, 0x18, 7); // Derived::x

    // Vector elements in chunk 1.
    for (i, v) in [10u64, 20, 30].iter().enumerate() {
        put_u64(&mut h, 0x40 + i * 8, *v);
    }

    // Box payload in chunk 2.
    put_u64(&mut h, 0x70, 0x2a);

    // Chunk 3 (the array g_past points one past the end of) stays zeroed.

    // Chunk 4: leaked object carrying a recoverable vtable word.
    put_u64(&mut h, 0xd0, VTABLE_DERIVED_SYM + 16);
    put_u64(&mut h, 0xd8, 9);

    h
}

fn module_map() -> ModuleMap {
    ModuleMap::new(vec![MappedModule::new(
        "/usr/bin/app",
        BuildId::new("app"),
        0,
        vec![(MODULE_BASE, MODULE_BASE + 0x100000)],
        SymbolTable::from_symbols(vec![
            Symbol {
                name: "_ZTV4Base".to_string(),
                address: VTABLE_BASE_SYM,
                size: 0x20,
                kind: SymbolKind::Data,
            },
            Symbol {
                name: "_ZTV7Derived".to_string(),
                address: VTABLE_DERIVED_SYM,
                size: 0x28,
                kind: SymbolKind::Data,
            },
        ]),
    )])
}

fn build_image(extra_leak: bool) -> MemoryImage {
    MemoryImage::from_regions(vec![
        MemoryRegion::new(MODULE_BASE, Permissions::RX, vec![0u8; 0x10000])
            .with_label("/usr/bin/app"),
        MemoryRegion::new(GLOBALS, Permissions::RW, globals_bytes()).with_label("/usr/bin/app"),
        MemoryRegion::new(HEAP, Permissions::RW, heap_bytes(extra_leak)).with_label("[heap]"),
    ])
    .unwrap()
}

/// Assemble a full analyzer plus its enumerated roots.
pub fn build_world(extra_leak: bool) -> (CoreAnalyzer, Vec<RootReference>) {
    init();
    let mut registry = DescriptorRegistry::new();
    registry.insert(catalog());
    let modules = module_map();
    let roots = coregraph_analysis::enumerate_global_roots(&registry, &modules);
    let analyzer = CoreAnalyzer::new(build_image(extra_leak), registry, modules)
        .with_config(AnalysisConfig::default().blind_scan(true));
    (analyzer, roots)
}
