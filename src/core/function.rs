use super::ctype::CType;

/// Function signature
#[derive(Debug, Clone)]
pub struct CFunction {
    pub ret: CType,
    pub params: Vec<CType>,
    pub variadic: bool,
}

impl CFunction {
    pub fn new(ret: CType, params: Vec<CType>, variadic: bool) -> Self {
        Self { ret, params, variadic }
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn is_same(&self, other: &CFunction) -> bool {
        self.variadic == other.variadic
            && self.params.len() == other.params.len()
            && self.ret.is_same(&other.ret, false)
            && self
                .params
                .iter()
                .zip(&other.params)
                .all(|(a, b)| a.is_same(b, true))
    }
}
