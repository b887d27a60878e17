//! The type system: unification variables, operators, least upper bound,
//! and capture-group type inference.
//!
//! Type variables are stable integer ids; their bindings live in a side
//! table owned by [`TypeCtx`], which is created per compile so parallel
//! compilations cannot interfere. `root` path-compresses as it resolves,
//! keeping variable chains shallow.

use std::fmt;

use regex_syntax::hir::{Class, Hir, HirKind};

/// Identifier of a unification variable within one [`TypeCtx`].
pub type TypeVarId = u32;

/// A type in a metrail program.
///
/// Nullary operators are direct variants; `Function` and `Dimension` are
/// the variadic operators ("→" and "⨯"). `Error` values propagate in
/// place of real types so one bad expression reports once.
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Var(TypeVarId),
    None,
    Bool,
    Int,
    Float,
    String,
    Pattern,
    Buckets,
    Undef,
    /// Function type: argument types followed by the return type.
    Function(Vec<Type>),
    /// Dimension (product) type: key types followed by the value type.
    Dimension(Vec<Type>),
    Error(Box<TypeError>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeErrorKind {
    Mismatch,
    RecursiveUnification,
    Internal,
}

/// A type was expected but another was encountered.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeError {
    pub kind: TypeErrorKind,
    pub expected: Type,
    pub received: Type,
}

impl TypeError {
    fn new(kind: TypeErrorKind, expected: Type, received: Type) -> Type {
        Type::Error(Box::new(TypeError {
            kind,
            expected,
            received,
        }))
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            TypeErrorKind::Mismatch => "type mismatch",
            TypeErrorKind::RecursiveUnification => "recursive unification error",
            TypeErrorKind::Internal => "internal error",
        };
        write!(f, "{}; expected {} received {}", what, self.expected, self.received)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Var(id) => write!(f, "typeVar{}", id),
            Type::None => write!(f, "None"),
            Type::Bool => write!(f, "Bool"),
            Type::Int => write!(f, "Int"),
            Type::Float => write!(f, "Float"),
            Type::String => write!(f, "String"),
            Type::Pattern => write!(f, "Pattern"),
            Type::Buckets => write!(f, "Buckets"),
            Type::Undef => write!(f, "Undef"),
            Type::Function(args) => {
                let mut first = true;
                for a in args {
                    if !first {
                        write!(f, "→")?;
                    }
                    first = false;
                    write!(f, "{}", a)?;
                }
                Ok(())
            }
            Type::Dimension(args) => {
                let mut first = true;
                for a in args {
                    if !first {
                        write!(f, "⨯")?;
                    }
                    first = false;
                    write!(f, "{}", a)?;
                }
                Ok(())
            }
            Type::Error(e) => write!(f, "{}", e),
        }
    }
}

impl Type {
    pub fn is_error(&self) -> bool {
        matches!(self, Type::Error(_))
    }
}

/// Per-compile unification state.
#[derive(Debug, Default)]
pub struct TypeCtx {
    instances: Vec<Option<Type>>,
}

impl TypeCtx {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh unbound type variable.
    pub fn fresh(&mut self) -> Type {
        let id = self.instances.len() as TypeVarId;
        self.instances.push(Option::None);
        Type::Var(id)
    }

    /// Representative of a type after unification, path-compressing
    /// variable chains as it goes.
    pub fn root(&mut self, t: &Type) -> Type {
        match t {
            Type::Var(id) => match self.instances[*id as usize].clone() {
                Option::None => t.clone(),
                Some(inst) => {
                    let r = self.root(&inst);
                    self.instances[*id as usize] = Some(r.clone());
                    r
                }
            },
            other => other.clone(),
        }
    }

    fn set_instance(&mut self, id: TypeVarId, t: Type) {
        self.instances[id as usize] = Some(t);
    }

    /// Structural equality on roots.
    pub fn equals(&mut self, a: &Type, b: &Type) -> bool {
        let (a, b) = (self.root(a), self.root(b));
        match (&a, &b) {
            (Type::Var(x), Type::Var(y)) => x == y,
            (Type::Function(xs), Type::Function(ys)) | (Type::Dimension(xs), Type::Dimension(ys)) => {
                if xs.len() != ys.len() {
                    return false;
                }
                let pairs: Vec<(Type, Type)> =
                    xs.iter().cloned().zip(ys.iter().cloned()).collect();
                pairs.iter().all(|(x, y)| self.equals(x, y))
            }
            (Type::Error(_), _) | (_, Type::Error(_)) => false,
            _ => std::mem::discriminant(&a) == std::mem::discriminant(&b),
        }
    }

    /// True if `v` (a variable) occurs in `t`.
    fn occurs_in(&mut self, v: TypeVarId, t: &Type) -> bool {
        let root = self.root(t);
        match root {
            Type::Var(id) => id == v,
            Type::Function(args) | Type::Dimension(args) => {
                args.iter().any(|a| self.occurs_in(v, &a.clone()))
            }
            _ => false,
        }
    }

    /// Unify two types, returning their least upper bound. Variables are
    /// bound to the result. `a` is the expected type, `b` the observed.
    pub fn unify(&mut self, a: &Type, b: &Type) -> Type {
        let a1 = self.root(a);
        let b1 = self.root(b);
        match (&a1, &b1) {
            (Type::Error(_), _) => a1,
            (_, Type::Error(_)) => b1,
            (Type::Var(av), Type::Var(bv)) => {
                if av != bv {
                    self.set_instance(*av, b1.clone());
                    b1
                } else {
                    a1
                }
            }
            (Type::Var(av), _) => {
                if self.occurs_in(*av, &b1) {
                    TypeError::new(TypeErrorKind::RecursiveUnification, a1.clone(), b1.clone())
                } else {
                    self.set_instance(*av, b1.clone());
                    b1
                }
            }
            (_, Type::Var(_)) => {
                let t = self.unify(&b1, &a1);
                if let Type::Error(e) = t {
                    TypeError::new(e.kind, e.received, e.expected)
                } else {
                    t
                }
            }
            _ => self.unify_operators(&a1, &b1),
        }
    }

    fn unify_operators(&mut self, a: &Type, b: &Type) -> Type {
        let a_args = operator_args(a);
        let b_args = operator_args(b);
        if a_args.len() != b_args.len() {
            return TypeError::new(TypeErrorKind::Mismatch, a.clone(), b.clone());
        }

        // Nullary operators unify to their least upper bound directly.
        if a_args.is_empty() {
            if self.equals(a, b) {
                return a.clone();
            }
            return self.lub(a, b);
        }

        let same_shape = matches!(
            (a, b),
            (Type::Function(_), Type::Function(_)) | (Type::Dimension(_), Type::Dimension(_))
        );
        if !same_shape {
            return TypeError::new(TypeErrorKind::Mismatch, a.clone(), b.clone());
        }

        let mut args = Vec::with_capacity(a_args.len());
        for (x, y) in a_args.iter().zip(b_args.iter()) {
            let t = self.unify(x, y);
            if t.is_error() {
                return t;
            }
            args.push(t);
        }
        match a {
            Type::Function(_) => Type::Function(args),
            _ => Type::Dimension(args),
        }
    }

    /// Least upper bound on the widening lattice.
    pub fn lub(&mut self, a: &Type, b: &Type) -> Type {
        let a1 = self.root(a);
        let b1 = self.root(b);

        if self.equals(&a1, &b1) {
            return a1;
        }
        // A variable's bound is whatever the other side is.
        if matches!(a1, Type::Var(_)) {
            return b1;
        }
        if matches!(b1, Type::Var(_)) {
            return a1;
        }
        if matches!(a1, Type::Undef) {
            return b1;
        }
        if matches!(b1, Type::Undef) {
            return a1;
        }
        let d = std::mem::discriminant::<Type>;
        let pair = |x: &Type, y: &Type| {
            (d(&a1) == d(x) && d(&b1) == d(y)) || (d(&b1) == d(x) && d(&a1) == d(y))
        };
        if pair(&Type::Float, &Type::Int) {
            return Type::Float;
        }
        if pair(&Type::String, &Type::Int) || pair(&Type::String, &Type::Float) {
            return Type::String;
        }
        if pair(&Type::Pattern, &Type::Bool) {
            return Type::Bool;
        }
        if pair(&Type::Bool, &Type::Int) {
            return Type::Int;
        }
        // A string can be a pattern, but not vice versa.
        if pair(&Type::String, &Type::Pattern) {
            return Type::Pattern;
        }
        // A pattern and an Int are Bool.
        if pair(&Type::Pattern, &Type::Int) {
            return Type::Bool;
        }
        TypeError::new(TypeErrorKind::Mismatch, a.clone(), b.clone())
    }

    /// True when the transitive closure of roots contains no variable.
    pub fn is_complete(&mut self, t: &Type) -> bool {
        match self.root(t) {
            Type::Var(_) | Type::Error(_) => false,
            Type::Function(args) | Type::Dimension(args) => {
                args.iter().all(|a| self.is_complete(&a.clone()))
            }
            _ => true,
        }
    }

    /// Fully substitute variables in `t` for display and final annotation.
    pub fn resolve(&mut self, t: &Type) -> Type {
        match self.root(t) {
            Type::Function(args) => {
                Type::Function(args.iter().map(|a| self.resolve(&a.clone())).collect())
            }
            Type::Dimension(args) => {
                Type::Dimension(args.iter().map(|a| self.resolve(&a.clone())).collect())
            }
            other => other,
        }
    }

    /// Type scheme of a builtin function, instantiated with fresh
    /// variables. Argument types precede the return type.
    pub fn builtin_type(&mut self, name: &str) -> Option<Type> {
        let t = match name {
            "int" => Type::Function(vec![self.fresh(), Type::Int]),
            "bool" => Type::Function(vec![self.fresh(), Type::Bool]),
            "float" => Type::Function(vec![self.fresh(), Type::Float]),
            "string" => Type::Function(vec![self.fresh(), Type::String]),
            "timestamp" => Type::Function(vec![Type::Int]),
            "len" => Type::Function(vec![Type::String, Type::Int]),
            "settime" => Type::Function(vec![Type::Int, Type::None]),
            "strptime" => Type::Function(vec![Type::String, Type::String, Type::None]),
            "strtol" => Type::Function(vec![Type::String, Type::Int, Type::Int]),
            "tolower" => Type::Function(vec![Type::String, Type::String]),
            "getfilename" => Type::Function(vec![Type::String]),
            "subst" => Type::Function(vec![Type::Pattern, Type::String, Type::String, Type::String]),
            _ => return Option::None,
        };
        Some(t)
    }
}

fn operator_args(t: &Type) -> &[Type] {
    match t {
        Type::Function(args) | Type::Dimension(args) => args,
        _ => &[],
    }
}

/// Infer a type for the `group`th capture group of a compiled pattern,
/// from what the group can match.
///
/// Groups matching only sign and digit characters (with at least one
/// digit) are `Int`; adding `.`/`e`/`E` (with at most one dot) makes
/// `Float`; alternations take the least upper bound over branches;
/// everything else is `String`.
pub fn infer_capref_type(ctx: &mut TypeCtx, hir: &Hir, group: u32) -> Type {
    let Some(sub) = capture_group(hir, group) else {
        return Type::None;
    };
    if let HirKind::Alternation(subs) = sub.kind() {
        let mut t = Type::Undef;
        for branch in subs {
            let bt = infer_group_type(branch);
            t = ctx.lub(&t, &bt);
        }
        return t;
    }
    infer_group_type(sub)
}

fn infer_group_type(group: &Hir) -> Type {
    if group_only_matches(group, "+-") {
        return Type::String;
    }
    if group_only_matches(group, "+-0123456789") {
        // Must contain at least one digit, and a bare class or
        // alternation stays a string.
        if !group.to_string().contains(|c: char| c.is_ascii_digit()) {
            return Type::String;
        }
        if matches!(group.kind(), HirKind::Alternation(_) | HirKind::Class(_)) {
            return Type::String;
        }
        return Type::Int;
    }
    if group_only_matches(group, "+-0123456789.eE") {
        // Only one decimal point allowed.
        if group.to_string().matches('.').count() > 1 {
            return Type::String;
        }
        return Type::Float;
    }
    Type::String
}

/// The subexpression of the capture group numbered `index`.
fn capture_group(hir: &Hir, index: u32) -> Option<&Hir> {
    match hir.kind() {
        HirKind::Capture(cap) => {
            if cap.index == index {
                Some(&cap.sub)
            } else {
                capture_group(&cap.sub, index)
            }
        }
        HirKind::Concat(subs) | HirKind::Alternation(subs) => {
            subs.iter().find_map(|s| capture_group(s, index))
        }
        HirKind::Repetition(rep) => capture_group(&rep.sub, index),
        _ => Option::None,
    }
}

/// True iff the subexpression can only ever match characters in `set`.
fn group_only_matches(group: &Hir, set: &str) -> bool {
    match group.kind() {
        HirKind::Literal(lit) => match std::str::from_utf8(&lit.0) {
            Ok(s) => s.chars().all(|c| set.contains(c)),
            Err(_) => false,
        },
        HirKind::Class(Class::Unicode(cls)) => cls.ranges().iter().all(|r| {
            let span = u32::from(r.end()).saturating_sub(u32::from(r.start()));
            if span as usize >= set.len() {
                return false;
            }
            (u32::from(r.start())..=u32::from(r.end()))
                .filter_map(char::from_u32)
                .all(|c| set.contains(c))
        }),
        HirKind::Class(Class::Bytes(cls)) => cls.ranges().iter().all(|r| {
            let span = (r.end() - r.start()) as usize;
            if span >= set.len() {
                return false;
            }
            (r.start()..=r.end()).all(|b| set.contains(b as char))
        }),
        HirKind::Repetition(rep) => group_only_matches(&rep.sub, set),
        HirKind::Capture(cap) => group_only_matches(&cap.sub, set),
        HirKind::Concat(subs) | HirKind::Alternation(subs) => {
            subs.iter().all(|s| group_only_matches(s, set))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hir(pattern: &str) -> Hir {
        // ASCII class semantics, as the checker parses patterns.
        regex_syntax::ParserBuilder::new()
            .unicode(false)
            .utf8(false)
            .build()
            .parse(pattern)
            .unwrap()
    }

    #[test]
    fn test_unify_var_binds_to_operator() {
        let mut ctx = TypeCtx::new();
        let v = ctx.fresh();
        assert_eq!(ctx.unify(&v, &Type::Int), Type::Int);
        assert_eq!(ctx.root(&v), Type::Int);
    }

    #[test]
    fn test_unify_two_vars_share_binding() {
        let mut ctx = TypeCtx::new();
        let a = ctx.fresh();
        let b = ctx.fresh();
        ctx.unify(&a, &b);
        ctx.unify(&b, &Type::Float);
        assert_eq!(ctx.root(&a), Type::Float);
    }

    #[test]
    fn test_unify_widens_int_float() {
        let mut ctx = TypeCtx::new();
        assert_eq!(ctx.unify(&Type::Int, &Type::Float), Type::Float);
    }

    #[test]
    fn test_unify_idempotent() {
        let mut ctx = TypeCtx::new();
        let first = ctx.unify(&Type::Int, &Type::String);
        let second = ctx.unify(&first, &first);
        assert_eq!(first, second);
    }

    #[test]
    fn test_unify_mismatch() {
        let mut ctx = TypeCtx::new();
        let t = ctx.unify(&Type::None, &Type::Float);
        assert!(t.is_error());
    }

    #[test]
    fn test_recursive_unification_fails() {
        let mut ctx = TypeCtx::new();
        let v = ctx.fresh();
        let f = Type::Function(vec![v.clone(), Type::Int]);
        let t = ctx.unify(&v, &f);
        let Type::Error(e) = t else {
            panic!("expected error, got {}", t);
        };
        assert_eq!(e.kind, TypeErrorKind::RecursiveUnification);
    }

    #[test]
    fn test_function_unification() {
        let mut ctx = TypeCtx::new();
        let v = ctx.fresh();
        let call = Type::Function(vec![Type::String, v.clone()]);
        let scheme = Type::Function(vec![Type::String, Type::Int]);
        let t = ctx.unify(&scheme, &call);
        assert_eq!(t, Type::Function(vec![Type::String, Type::Int]));
        assert_eq!(ctx.root(&v), Type::Int);
    }

    #[test]
    fn test_lub_commutative() {
        let mut ctx = TypeCtx::new();
        let cases = [
            (Type::Int, Type::Float),
            (Type::Int, Type::String),
            (Type::Pattern, Type::Bool),
            (Type::Int, Type::Bool),
            (Type::String, Type::Pattern),
            (Type::Int, Type::Pattern),
            (Type::Undef, Type::Float),
        ];
        for (a, b) in cases {
            let ab = ctx.lub(&a, &b);
            let ba = ctx.lub(&b, &a);
            assert_eq!(ab, ba, "lub({}, {})", a, b);
        }
    }

    #[test]
    fn test_lub_idempotent() {
        let mut ctx = TypeCtx::new();
        for t in [Type::Int, Type::Float, Type::String, Type::Pattern, Type::Bool] {
            assert_eq!(ctx.lub(&t, &t), t);
        }
    }

    #[test]
    fn test_lub_table() {
        let mut ctx = TypeCtx::new();
        assert_eq!(ctx.lub(&Type::Int, &Type::Float), Type::Float);
        assert_eq!(ctx.lub(&Type::Float, &Type::String), Type::String);
        assert_eq!(ctx.lub(&Type::Pattern, &Type::Bool), Type::Bool);
        assert_eq!(ctx.lub(&Type::Int, &Type::Bool), Type::Int);
        assert_eq!(ctx.lub(&Type::String, &Type::Pattern), Type::Pattern);
        assert_eq!(ctx.lub(&Type::Int, &Type::Pattern), Type::Bool);
        assert!(ctx.lub(&Type::None, &Type::Int).is_error());
    }

    #[test]
    fn test_is_complete() {
        let mut ctx = TypeCtx::new();
        let v = ctx.fresh();
        assert!(!ctx.is_complete(&v));
        assert!(!ctx.is_complete(&Type::Function(vec![v.clone(), Type::Int])));
        ctx.unify(&v, &Type::String);
        assert!(ctx.is_complete(&v));
        assert!(ctx.is_complete(&Type::Function(vec![Type::String, Type::Int])));
    }

    #[test]
    fn test_capref_digits_is_int() {
        let mut ctx = TypeCtx::new();
        let h = hir(r"host=(\S+) bytes=(\d+)");
        assert_eq!(infer_capref_type(&mut ctx, &h, 1), Type::String);
        assert_eq!(infer_capref_type(&mut ctx, &h, 2), Type::Int);
    }

    #[test]
    fn test_capref_signed_int() {
        let mut ctx = TypeCtx::new();
        let h = hir(r"(-?\d+)");
        assert_eq!(infer_capref_type(&mut ctx, &h, 1), Type::Int);
    }

    #[test]
    fn test_capref_float() {
        let mut ctx = TypeCtx::new();
        let h = hir(r"(\d+\.\d+)");
        assert_eq!(infer_capref_type(&mut ctx, &h, 1), Type::Float);
        // Two dots cannot be a float.
        let h2 = hir(r"(\d+\.\d+\.\d+)");
        assert_eq!(infer_capref_type(&mut ctx, &h2, 1), Type::String);
    }

    #[test]
    fn test_capref_bare_class_is_string() {
        let mut ctx = TypeCtx::new();
        let h = hir(r"([0-9])");
        assert_eq!(infer_capref_type(&mut ctx, &h, 1), Type::String);
    }

    #[test]
    fn test_capref_alternation_lub() {
        let mut ctx = TypeCtx::new();
        let h = hir(r"(\d+|\d+\.\d+)");
        assert_eq!(infer_capref_type(&mut ctx, &h, 1), Type::Float);
        let h2 = hir(r"(\d+|foo)");
        assert_eq!(infer_capref_type(&mut ctx, &h2, 1), Type::String);
    }

    #[test]
    fn test_capref_named_group_by_index() {
        let mut ctx = TypeCtx::new();
        let h = hir(r"host=(?P<h>\S+) bytes=(?P<n>\d+)");
        assert_eq!(infer_capref_type(&mut ctx, &h, 2), Type::Int);
    }

    #[test]
    fn test_capref_missing_group_is_none() {
        let mut ctx = TypeCtx::new();
        let h = hir(r"abc");
        assert_eq!(infer_capref_type(&mut ctx, &h, 1), Type::None);
    }
}
