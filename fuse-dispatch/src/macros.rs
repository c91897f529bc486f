macro_rules! setters {
    ($($f:ident: $t:ty,)+) => {$(
        #[allow(missing_docs)]
        #[inline]
        pub fn $f(&mut self, $f: $t) -> &mut Self {
            self.$f = $f;
            self
        }
    )+};
}
