use rsparse::{
    data::{self, Numeric, Symb},
    lsolve, lu, sqr, usolve,
};

use super::Solve;

#[derive(Default)]
pub struct RSparseSolver {
    x: Vec<f64>,
    symbolic: Option<Symb>,
}

#[allow(non_snake_case)]
impl Solve for RSparseSolver {
    /// Solves the sparse linear system with a left-looking LU from `rsparse`.
    ///
    /// The column ordering is computed on the first call and reused until [`Solve::reset`].
    fn solve(
        &mut self,
        Ap: &mut [usize],
        Ai: &mut [usize],
        Ax: &mut [f64],
        b: &mut [f64],
        n: usize,
    ) -> Result<(), &'static str> {
        if Ap.len() != n + 1 || b.len() != n {
            return Err("dimension mismatch");
        }
        let a = data::Sprs {
            m: n,
            n,
            i: Ai.to_vec(),
            p: Ap.iter().map(|&v| v as isize).collect(),
            x: Ax.to_vec(),
            nzmax: Ax.len(),
        };
        let s = self.symbolic.get_or_insert_with(|| sqr(&a, 1, false));
        self.x.resize(n, 0.0);
        let x = &mut self.x;
        let f = lu(&a, s, 1e-6).map_err(|_| "LU factorization failed")?; // numeric LU factorization
        ipvec(&f.pinv, b, &mut x[..]); // x = P*b
        lsolve(&f.l, x); // x = L\x
        usolve(&f.u, x); // x = U\x
        ipvec(&s.q, &x[..], b); // b = Q*x
        Ok(())
    }

    fn reset(&mut self) {
        self.symbolic = None;
    }
}

fn ipvec<T: Numeric<T>>(p: &Option<Vec<isize>>, b: &[T], x: &mut [T]) {
    match p {
        Some(pvec) => {
            for k in 0..b.len() {
                x[pvec[k] as usize] = b[k];
            }
        }
        None => x.copy_from_slice(b),
    }
}
