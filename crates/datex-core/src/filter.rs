//! Filter algebra - boolean formulas over targets in conjunctive normal form
//!
//! Every filter is reduced to a canonical AND-of-ORs. The reduction removes
//! duplicate literals, resolves a unit literal against its negation,
//! drops subsumed disjuncts and lets an endpoint literal absorb the
//! unqualified form of the same endpoint.

use std::fmt;

use crate::Target;

/// A possibly negated target
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Literal {
    pub target: Target,
    pub negated: bool,
}

impl Literal {
    pub fn positive(target: Target) -> Self {
        Literal {
            target,
            negated: false,
        }
    }

    pub fn negative(target: Target) -> Self {
        Literal {
            target,
            negated: true,
        }
    }

    pub fn negate(&self) -> Self {
        Literal {
            target: self.target.clone(),
            negated: !self.negated,
        }
    }

    /// Whether this literal holds for the candidate set
    pub fn holds(&self, candidates: &[Target]) -> bool {
        let present = candidates.iter().any(|c| self.target.matches(c));
        present != self.negated
    }

    /// Whether `self` being true forces `other` to be true
    fn implies(&self, other: &Literal) -> bool {
        if self.negated != other.negated {
            return false;
        }
        if self.negated {
            // nothing matching self => nothing matching a narrower target
            self.target.matches(&other.target)
        } else {
            other.target.matches(&self.target)
        }
    }

    fn contradicts(&self, other: &Literal) -> bool {
        self.negated != other.negated && self.target == other.target
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            write!(f, "!{}", self.target)
        } else {
            write!(f, "{}", self.target)
        }
    }
}

/// Disjunction of literals
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Clause(pub Vec<Literal>);

impl Clause {
    pub fn unit(literal: Literal) -> Self {
        Clause(vec![literal])
    }

    pub fn literals(&self) -> &[Literal] {
        &self.0
    }

    pub fn is_unit(&self) -> bool {
        self.0.len() == 1
    }

    pub fn holds(&self, candidates: &[Target]) -> bool {
        self.0.iter().any(|l| l.holds(candidates))
    }

    fn is_tautology(&self) -> bool {
        self.0
            .iter()
            .any(|a| self.0.iter().any(|b| a.contradicts(b)))
    }

    /// Sort, dedup and absorb literals implied by another literal
    fn normalize(mut self) -> Self {
        self.0.sort();
        self.0.dedup();
        let lits = self.0.clone();
        self.0.retain(|l| {
            !lits
                .iter()
                .any(|other| other != l && l.implies(other) && (!other.implies(l) || other < l))
        });
        self
    }

    /// `self` subsumes `other` when every literal of `self` implies one of `other`
    fn subsumes(&self, other: &Clause) -> bool {
        self.0
            .iter()
            .all(|l| other.0.iter().any(|o| l == o || l.implies(o)))
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let wrap = self.0.len() > 1;
        if wrap {
            f.write_str("(")?;
        }
        for (i, l) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            write!(f, "{}", l)?;
        }
        if wrap {
            f.write_str(")")?;
        }
        Ok(())
    }
}

/// Canonical conjunctive normal form
///
/// An empty clause list is unsatisfiable unless the form is the
/// tautology produced by negating an unsatisfiable form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct Cnf {
    clauses: Vec<Clause>,
    always: bool,
}

impl Cnf {
    /// The unsatisfiable form
    pub fn never() -> Self {
        Cnf::default()
    }

    /// The form every candidate set satisfies
    pub fn always() -> Self {
        Cnf {
            clauses: Vec::new(),
            always: true,
        }
    }

    pub fn literal(literal: Literal) -> Self {
        Cnf {
            clauses: vec![Clause::unit(literal)],
            always: false,
        }
    }

    pub fn target(target: Target) -> Self {
        Cnf::literal(Literal::positive(target))
    }

    /// Build from raw clauses, reducing to canonical form
    pub fn from_clauses(clauses: Vec<Clause>) -> Self {
        Cnf::reduce(clauses)
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn is_unsatisfiable(&self) -> bool {
        self.clauses.is_empty() && !self.always
    }

    pub fn is_always(&self) -> bool {
        self.always
    }

    /// Number of AND-conjuncts
    pub fn len(&self) -> usize {
        self.clauses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Distinct targets in first-seen order
    pub fn targets(&self) -> Vec<Target> {
        let mut out: Vec<Target> = Vec::new();
        for clause in &self.clauses {
            for lit in &clause.0 {
                if !out.contains(&lit.target) {
                    out.push(lit.target.clone());
                }
            }
        }
        out
    }

    /// Positive unit literals - the directly addressed targets
    pub fn required_targets(&self) -> Vec<Target> {
        self.clauses
            .iter()
            .filter(|c| c.is_unit() && !c.0[0].negated)
            .map(|c| c.0[0].target.clone())
            .collect()
    }

    /// Evaluate against a candidate set
    pub fn test(&self, candidates: &[Target]) -> bool {
        if self.always {
            return true;
        }
        if self.clauses.is_empty() {
            return false;
        }
        self.clauses.iter().all(|c| c.holds(candidates))
    }

    pub fn and(&self, other: &Cnf) -> Cnf {
        if self.is_unsatisfiable() || other.is_unsatisfiable() {
            return Cnf::never();
        }
        if self.always {
            return other.clone();
        }
        if other.always {
            return self.clone();
        }
        let mut clauses = self.clauses.clone();
        clauses.extend(other.clauses.iter().cloned());
        Cnf::reduce(clauses)
    }

    /// Distribute via cartesian product of the two clause sets
    pub fn or(&self, other: &Cnf) -> Cnf {
        if self.always || other.always {
            return Cnf::always();
        }
        if self.is_unsatisfiable() {
            return other.clone();
        }
        if other.is_unsatisfiable() {
            return self.clone();
        }
        let mut clauses = Vec::with_capacity(self.clauses.len() * other.clauses.len());
        for a in &self.clauses {
            for b in &other.clauses {
                let mut lits = a.0.clone();
                lits.extend(b.0.iter().cloned());
                clauses.push(Clause(lits));
            }
        }
        Cnf::reduce(clauses)
    }

    /// De Morgan: the negation of an AND of ORs is an OR of ANDs of negated literals
    pub fn negate(&self) -> Cnf {
        if self.always {
            return Cnf::never();
        }
        if self.clauses.is_empty() {
            return Cnf::always();
        }
        let mut result = Cnf::never();
        for clause in &self.clauses {
            let negated = Cnf::reduce(
                clause
                    .0
                    .iter()
                    .map(|l| Clause::unit(l.negate()))
                    .collect(),
            );
            result = result.or(&negated);
        }
        result
    }

    fn reduce(clauses: Vec<Clause>) -> Cnf {
        let mut clauses: Vec<Clause> = clauses.into_iter().map(Clause::normalize).collect();

        // unit resolution: a unit literal removes its negation from other disjuncts
        loop {
            let units: Vec<Literal> = clauses
                .iter()
                .filter(|c| c.is_unit())
                .map(|c| c.0[0].clone())
                .collect();
            let mut changed = false;
            for clause in clauses.iter_mut() {
                if clause.is_unit() {
                    continue;
                }
                let before = clause.0.len();
                clause.0.retain(|l| !units.iter().any(|u| u.contradicts(l)));
                changed |= clause.0.len() != before;
            }
            let contradiction = units
                .iter()
                .any(|u| units.iter().any(|v| u.contradicts(v) || unit_conflict(u, v)));
            if contradiction || clauses.iter().any(|c| c.0.is_empty()) {
                return Cnf::never();
            }
            if !changed {
                break;
            }
        }

        let had_clauses = !clauses.is_empty();
        let non_taut: Vec<Clause> = clauses
            .iter()
            .filter(|c| !c.is_tautology())
            .cloned()
            .collect();
        if had_clauses && non_taut.is_empty() {
            return Cnf::always();
        }
        let mut clauses = non_taut;

        clauses.sort();
        clauses.dedup();

        let snapshot = clauses.clone();
        clauses.retain(|c| {
            !snapshot
                .iter()
                .any(|other| other != c && other.subsumes(c) && (!c.subsumes(other) || other < c))
        });

        Cnf {
            clauses,
            always: false,
        }
    }
}

/// A positive unit and a negative unit whose target covers it cannot both hold
fn unit_conflict(a: &Literal, b: &Literal) -> bool {
    match (a.negated, b.negated) {
        (false, true) => b.target.matches(&a.target),
        (true, false) => a.target.matches(&b.target),
        _ => false,
    }
}

impl fmt::Display for Cnf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.always {
            return f.write_str("*");
        }
        if self.clauses.is_empty() {
            return f.write_str("!*");
        }
        for (i, c) in self.clauses.iter().enumerate() {
            if i > 0 {
                f.write_str(" & ")?;
            }
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

/// Unreduced filter expression
#[derive(Clone, Debug, PartialEq)]
pub enum FilterExpr {
    Target(Target),
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    Not(Box<FilterExpr>),
    Cnf(Cnf),
}

impl FilterExpr {
    pub fn target(t: impl Into<Target>) -> Self {
        FilterExpr::Target(t.into())
    }

    pub fn and(self, other: FilterExpr) -> Self {
        FilterExpr::And(vec![self, other])
    }

    pub fn or(self, other: FilterExpr) -> Self {
        FilterExpr::Or(vec![self, other])
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        FilterExpr::Not(Box::new(self))
    }
}

impl From<Target> for FilterExpr {
    fn from(t: Target) -> Self {
        FilterExpr::Target(t)
    }
}

/// Reduce a filter expression to canonical CNF
///
/// An empty conjunction or disjunction addresses nobody.
pub fn to_normal_form(expr: &FilterExpr) -> Cnf {
    match expr {
        FilterExpr::Target(t) => Cnf::target(t.clone()),
        FilterExpr::Cnf(c) => c.clone(),
        FilterExpr::Not(inner) => to_normal_form(inner).negate(),
        FilterExpr::And(items) => {
            let mut iter = items.iter();
            let Some(first) = iter.next() else {
                return Cnf::never();
            };
            iter.fold(to_normal_form(first), |acc, e| acc.and(&to_normal_form(e)))
        }
        FilterExpr::Or(items) => items
            .iter()
            .fold(Cnf::never(), |acc, e| acc.or(&to_normal_form(e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Endpoint;

    fn t(name: &str) -> Target {
        Target::parse(name).unwrap()
    }

    fn e(name: &str) -> FilterExpr {
        FilterExpr::Target(t(name))
    }

    #[test]
    fn test_absorption() {
        let a_and_a_or_b = e("@a").and(e("@a").or(e("@b")));
        assert_eq!(to_normal_form(&a_and_a_or_b), to_normal_form(&e("@a")));
        assert_eq!(to_normal_form(&a_and_a_or_b).len(), 1);
    }

    #[test]
    fn test_contradiction_is_empty() {
        let cnf = to_normal_form(&e("@a").and(e("@a").not()));
        assert!(cnf.is_unsatisfiable());
        assert!(cnf.is_empty());
        assert!(!cnf.test(&[t("@a")]));
        assert!(!cnf.test(&[]));
    }

    #[test]
    fn test_double_negation() {
        assert_eq!(to_normal_form(&e("@a").not().not()), to_normal_form(&e("@a")));
    }

    #[test]
    fn test_exclusion_filter() {
        let filter = e("@a").or(e("@b")).and(e("@c").not());
        let cnf = to_normal_form(&filter);

        assert!(!cnf.test(&[t("@a"), t("@c")]));
        assert!(cnf.test(&[t("@a")]));
        assert!(cnf.test(&[t("@b")]));
        assert!(!cnf.test(&[t("@c")]));
        assert!(!cnf.test(&[]));
    }

    #[test]
    fn test_endpoint_absorbs_unqualified_form() {
        // inside one disjunct the unqualified endpoint covers the instance
        let cnf = to_normal_form(&e("@a/phone").or(e("@a")));
        assert_eq!(cnf, to_normal_form(&e("@a")));

        // in a conjunction the instance literal is the stronger requirement
        let cnf = to_normal_form(&e("@a/phone").and(e("@a")));
        assert_eq!(cnf, to_normal_form(&e("@a/phone")));
    }

    #[test]
    fn test_tautology() {
        let cnf = to_normal_form(&e("@a").or(e("@a").not()));
        assert!(cnf.is_always());
        assert!(cnf.test(&[]));
        assert!(to_normal_form(&e("@a").and(e("@a").not()).not()).is_always());
    }

    #[test]
    fn test_de_morgan() {
        let lhs = to_normal_form(&e("@a").and(e("@b")).not());
        let rhs = to_normal_form(&e("@a").not().or(e("@b").not()));
        assert_eq!(lhs, rhs);

        let lhs = to_normal_form(&e("@a").or(e("@b")).not());
        let rhs = to_normal_form(&e("@a").not().and(e("@b").not()));
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn test_distribution() {
        // (a & b) | c == (a | c) & (b | c)
        let cnf = to_normal_form(&e("@a").and(e("@b")).or(e("@c")));
        assert_eq!(cnf.len(), 2);
        assert!(cnf.test(&[t("@c")]));
        assert!(cnf.test(&[t("@a"), t("@b")]));
        assert!(!cnf.test(&[t("@a")]));
    }

    #[test]
    fn test_instance_candidates() {
        let cnf = to_normal_form(&e("@a"));
        let phone = Target::Endpoint(Endpoint::person("a").with_instance("phone"));
        assert!(cnf.test(&[phone]));
    }

    #[test]
    fn test_display() {
        let cnf = to_normal_form(&e("@a").or(e("@b")).and(e("@c").not()));
        assert_eq!(cnf.to_string(), "(@a | @b) & !@c");
        assert_eq!(Cnf::never().to_string(), "!*");
    }

    #[test]
    fn test_targets_are_unique() {
        let cnf = to_normal_form(&e("@a").or(e("@b")).and(e("@a").or(e("@c"))));
        let targets = cnf.targets();
        assert_eq!(targets.len(), 3);
    }
}
