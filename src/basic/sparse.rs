pub(crate) mod conj;
pub(crate) mod stack;
